//! End-to-end pipeline tests with a scripted browser session and a canned
//! language model, from instruction text to persisted result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use webpilot::gateway::{GatewayStack, LlmBackend, LlmReply};
use webpilot::memory::SessionMemory;
use webpilot::session::{BrowsingSession, SessionProvider};
use webpilot::storage::TaskStore;
use webpilot::types::{LogLevel, RawFragment, StepOutcome, StepPayload, TaskStatus};
use webpilot::Engine;

struct CannedModel(&'static str);

#[async_trait]
impl LlmBackend for CannedModel {
    fn name(&self) -> &str {
        "canned"
    }
    async fn is_available(&self) -> bool {
        true
    }
    async fn generate(&self, _prompt: &str) -> Result<LlmReply> {
        Ok(LlmReply {
            content: self.0.to_string(),
            model: "canned".into(),
            tokens_used: None,
            latency: None,
        })
    }
}

struct DeadModel;

#[async_trait]
impl LlmBackend for DeadModel {
    fn name(&self) -> &str {
        "dead"
    }
    async fn is_available(&self) -> bool {
        true
    }
    async fn generate(&self, _prompt: &str) -> Result<LlmReply> {
        bail!("connection refused")
    }
}

/// Session that serves fixed fragments and optionally refuses navigation.
struct FixtureSession {
    fragments: Vec<RawFragment>,
    goto_fails: bool,
}

#[async_trait]
impl BrowsingSession for FixtureSession {
    async fn goto(&mut self, _url: &str, _timeout: Duration) -> StepOutcome {
        if self.goto_fails {
            StepOutcome::failure("net::ERR_NAME_NOT_RESOLVED")
        } else {
            StepOutcome::ok(None)
        }
    }
    async fn click(&mut self, _selector: &str, _timeout: Duration) -> StepOutcome {
        StepOutcome::ok(None)
    }
    async fn fill(&mut self, _selector: &str, _value: &str, _timeout: Duration) -> StepOutcome {
        StepOutcome::ok(None)
    }
    async fn extract(&mut self, _selector: &str, _multiple: bool, _t: Duration) -> StepOutcome {
        StepOutcome::ok(Some(StepPayload::Fragments(self.fragments.clone())))
    }
    async fn wait(&mut self, _seconds: u64) -> StepOutcome {
        StepOutcome::ok(None)
    }
    async fn screenshot(&mut self, _name: Option<&str>) -> StepOutcome {
        StepOutcome::ok(None)
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct FixtureProvider {
    fragments: Vec<RawFragment>,
    goto_fails: bool,
}

#[async_trait]
impl SessionProvider for FixtureProvider {
    async fn open(&self) -> Result<Box<dyn BrowsingSession>> {
        Ok(Box::new(FixtureSession {
            fragments: self.fragments.clone(),
            goto_fails: self.goto_fails,
        }))
    }
}

fn listing_fragment(title: &str, price: &str, href: &str) -> RawFragment {
    let mut fragment = RawFragment::from_text(format!("{title} {price} 4.2 out of 5"));
    fragment.attributes.insert("href".into(), href.into());
    fragment
}

fn engine(
    model: Box<dyn LlmBackend>,
    fragments: Vec<RawFragment>,
    goto_fails: bool,
) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::new(dir.path()).unwrap();
    let provider = Box::new(FixtureProvider {
        fragments,
        goto_fails,
    });
    let engine = Engine::new(
        Arc::new(GatewayStack::new(vec![model])),
        provider,
        store,
        SessionMemory::in_memory(),
    );
    (engine, dir)
}

const PRICED_SEARCH: &str = r#"{
  "task": "search",
  "query": "laptops",
  "filters": {"price_max": 50000},
  "count": 5,
  "fields": ["title", "price", "url"],
  "actions": []
}"#;

#[tokio::test]
async fn priced_search_filters_limits_and_persists() {
    let fragments = vec![
        listing_fragment("Laptop A", "₹39,999", "/a"),
        listing_fragment("Laptop B", "₹45,000", "/b"),
        listing_fragment("Laptop C", "₹55,000", "/c"),
        listing_fragment("Laptop D", "₹31,499", "/d"),
        listing_fragment("Laptop E", "₹48,250", "/e"),
        listing_fragment("Laptop F", "₹29,990", "/f"),
        listing_fragment("Laptop A", "₹39,999", "/a"),
    ];
    let (engine, _dir) = engine(Box::new(CannedModel(PRICED_SEARCH)), fragments, false);

    let result = engine
        .execute("search laptops under ₹50,000", None)
        .await;

    assert_eq!(result.status, TaskStatus::Success);
    assert!(result.records.len() <= 5);
    assert!(!result.records.is_empty());
    for record in &result.records {
        let price = record.price.as_deref().expect("price present");
        let numeric: f64 = price
            .trim_start_matches('₹')
            .replace(',', "")
            .parse()
            .unwrap();
        assert!(numeric <= 50000.0, "price over bound: {price}");
        // Relative URLs are resolved against a base.
        assert!(record.url.as_deref().unwrap().starts_with("https://"));
    }
    // The duplicated Laptop A survives only once.
    let a_count = result
        .records
        .iter()
        .filter(|r| r.title.as_deref() == Some("Laptop A ₹39,999 4.2 out of 5"))
        .count();
    assert!(a_count <= 1);

    let stored = engine.store().load(&result.task_id).unwrap().unwrap();
    assert_eq!(stored.records.len(), result.records.len());
    assert_eq!(engine.memory().await.len(), 1);
}

#[tokio::test]
async fn dead_model_falls_back_to_heuristics_and_still_runs() {
    let fragments = vec![listing_fragment("Result 1", "₹100", "/r1")];
    let (engine, _dir) = engine(Box::new(DeadModel), fragments, false);

    let result = engine.execute("search for anything", None).await;

    assert_eq!(result.status, TaskStatus::Success);
    assert!(!result.records.is_empty());
    assert!(
        result
            .log
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("heuristics")),
        "fallback parse should be visible in the log"
    );
}

#[tokio::test]
async fn failed_navigation_aborts_once_and_records_the_error() {
    let (engine, _dir) = engine(
        Box::new(CannedModel(PRICED_SEARCH)),
        vec![listing_fragment("never seen", "₹1", "/x")],
        true,
    );

    let result = engine.execute("search laptops", None).await;

    assert_eq!(result.status, TaskStatus::Error);
    assert!(result.records.is_empty());
    assert!(result.error_message.is_some());

    let aborts: Vec<_> = result
        .log
        .iter()
        .filter(|e| e.message.contains("aborting remaining plan"))
        .collect();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].level, LogLevel::Error);
    // No step after the aborted one was attempted.
    assert!(!result.log.iter().any(|e| e.message.contains("step 2 ")));

    // The failure is still on disk and in memory.
    assert!(engine.store().load(&result.task_id).unwrap().is_some());
    let memory = engine.memory().await;
    let entries = memory.recent(1);
    assert!(!entries[0].success);
}

#[tokio::test]
async fn memory_accumulates_across_tasks() {
    let fragments = vec![listing_fragment("Item", "₹10", "/i")];
    let (engine, _dir) = engine(Box::new(CannedModel(PRICED_SEARCH)), fragments, false);

    engine.execute("search laptops", None).await;
    engine.execute("search laptop bags", None).await;

    let memory = engine.memory().await;
    assert_eq!(memory.len(), 2);
    let stats = memory.stats();
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.successful_tasks, 2);
    assert_eq!(memory.find_similar("search laptops", 3).len(), 2);
}

#[tokio::test]
async fn explicit_task_id_is_preserved() {
    let fragments = vec![listing_fragment("Item", "₹10", "/i")];
    let (engine, _dir) = engine(Box::new(CannedModel(PRICED_SEARCH)), fragments, false);
    let result = engine
        .execute("search laptops", Some("my-task-42".into()))
        .await;
    assert_eq!(result.task_id, "my-task-42");
    assert!(engine.store().load("my-task-42").unwrap().is_some());
}
