use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::gateway::GatewayStack;
use crate::memory::MemoryContext;
use crate::types::{Filters, RawAction, StructuredIntent, TaskKind};

const PARSER_PROMPT: &str = r#"You are an AI agent that parses natural language instructions into structured JSON plans for web automation tasks.

Convert the user's instruction into a JSON object with this structure:
{
  "task": "search|navigate|extract|fill_form|click|screenshot",
  "query": "description of what to do",
  "filters": {"price_max": 50000, "sort": "rating"},
  "count": 5,
  "fields": ["title", "price", "url"],
  "target_url": "https://example.com",
  "selectors": {"search_box": "input[name='q']", "results": ".product-item"},
  "actions": [
    {"action": "goto", "url": "https://example.com"},
    {"action": "fill", "selector": "input[name='q']", "value": "search query"},
    {"action": "click", "selector": "button[type='submit']"},
    {"action": "extract", "selector": ".product-item", "multiple": true}
  ]
}

Return only valid JSON, no additional text."#;

/// How an instruction was turned into an intent: via the language model, or
/// via the keyword heuristics when the model path failed. Both variants carry
/// an intent of the same validated shape.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    Parsed(StructuredIntent),
    Fallback(StructuredIntent),
}

impl ParseOutcome {
    pub fn intent(&self) -> &StructuredIntent {
        match self {
            ParseOutcome::Parsed(i) | ParseOutcome::Fallback(i) => i,
        }
    }

    pub fn into_intent(self) -> StructuredIntent {
        match self {
            ParseOutcome::Parsed(i) | ParseOutcome::Fallback(i) => i,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ParseOutcome::Fallback(_))
    }
}

/// Intent fields exactly as the model emitted them, all optional.
#[derive(Debug, Default, Deserialize)]
struct RawIntent {
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    filters: Option<Filters>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    fields: Option<Vec<String>>,
    #[serde(default)]
    target_url: Option<String>,
    #[serde(default)]
    selectors: Option<HashMap<String, String>>,
    #[serde(default)]
    actions: Option<Vec<RawAction>>,
}

pub struct IntentParser {
    gateway: Arc<GatewayStack>,
    brace_block: Regex,
    fenced_block: Regex,
}

impl IntentParser {
    pub fn new(gateway: Arc<GatewayStack>) -> Self {
        Self {
            gateway,
            brace_block: Regex::new(r"(?s)\{.*\}").expect("valid regex"),
            fenced_block: Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"),
        }
    }

    /// Parse an instruction. Never errors: any failure on the model path
    /// falls back to keyword heuristics, and both paths converge on the same
    /// validated intent shape.
    pub async fn parse(&self, instruction: &str, context: &MemoryContext) -> ParseOutcome {
        match self.parse_with_model(instruction, context).await {
            Ok(intent) => {
                info!(task = %intent.task, query = %intent.query, "parsed instruction");
                ParseOutcome::Parsed(intent)
            }
            Err(err) => {
                warn!(error = %err, "model parse failed, using keyword heuristics");
                ParseOutcome::Fallback(heuristic_intent(instruction))
            }
        }
    }

    async fn parse_with_model(
        &self,
        instruction: &str,
        context: &MemoryContext,
    ) -> Result<StructuredIntent> {
        let mut prompt = format!("{PARSER_PROMPT}\n\nInstruction: {instruction}");
        if !context.similar.is_empty() {
            prompt.push_str("\n\nPreviously handled similar instructions:");
            for entry in &context.similar {
                let mark = if entry.success { "ok" } else { "failed" };
                prompt.push_str(&format!("\n- {} ({mark})", entry.instruction));
            }
        }

        let reply = self.gateway.generate(&prompt).await?;
        let json_str = self.extract_json(&reply.content);
        let raw: RawIntent = serde_json::from_str(json_str)?;
        Ok(validate(from_raw(raw, instruction)))
    }

    /// Pull a JSON object out of model output: first a brace-delimited block,
    /// then a fenced code block, then the raw text as a last resort.
    fn extract_json<'a>(&self, text: &'a str) -> &'a str {
        if let Some(m) = self.brace_block.find(text) {
            return m.as_str();
        }
        if let Some(c) = self.fenced_block.captures(text) {
            if let Some(m) = c.get(1) {
                return m.as_str();
            }
        }
        text
    }
}

fn from_raw(raw: RawIntent, instruction: &str) -> StructuredIntent {
    let task = raw
        .task
        .as_deref()
        .and_then(TaskKind::parse)
        .unwrap_or(TaskKind::Search);

    StructuredIntent {
        task,
        query: raw.query.unwrap_or_else(|| instruction.to_string()),
        filters: raw.filters.unwrap_or_default(),
        count: raw.count.unwrap_or(5),
        fields: raw
            .fields
            .unwrap_or_else(|| vec!["title".into(), "url".into()]),
        target_url: raw.target_url.filter(|u| !u.is_empty()),
        selectors: raw.selectors.unwrap_or_default(),
        actions: raw.actions.unwrap_or_default(),
        raw_instruction: instruction.to_string(),
    }
}

/// Keyword-heuristic intent used when the model path fails.
fn heuristic_intent(instruction: &str) -> StructuredIntent {
    let lower = instruction.to_lowercase();
    let task = if lower.contains("search") {
        TaskKind::Search
    } else if lower.contains("navigate") || lower.contains("go to") {
        TaskKind::Navigate
    } else if lower.contains("extract") || lower.contains("get") {
        TaskKind::Extract
    } else if lower.contains("fill") || lower.contains("form") {
        TaskKind::FillForm
    } else {
        TaskKind::Search
    };

    validate(StructuredIntent {
        task,
        query: instruction.to_string(),
        filters: Filters::default(),
        count: 5,
        fields: vec!["title".into(), "url".into()],
        target_url: None,
        selectors: HashMap::new(),
        actions: Vec::new(),
        raw_instruction: instruction.to_string(),
    })
}

/// Pure defaulting transform shared by the model and heuristic paths. After
/// this, the query is non-empty, a target URL is set, and the selector map is
/// populated (the action list may stay empty for task kinds the planner
/// covers with a template).
pub(crate) fn validate(mut intent: StructuredIntent) -> StructuredIntent {
    if intent.query.is_empty() {
        intent.query = intent.raw_instruction.clone();
    }
    if intent.target_url.is_none() {
        intent.target_url = Some(default_url(intent.task).to_string());
    }
    if intent.selectors.is_empty() {
        intent.selectors = default_selectors(intent.task);
    }
    if intent.actions.is_empty() {
        intent.actions = default_actions(&intent);
    }
    intent
}

fn default_url(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Search => "https://www.google.com",
        TaskKind::FillForm => "https://www.example.com/contact",
        _ => "https://www.example.com",
    }
}

fn default_selectors(task: TaskKind) -> HashMap<String, String> {
    let pairs: &[(&str, &str)] = match task {
        TaskKind::Navigate => &[
            ("page_content", "body, main, .content"),
            ("navigation", "nav, .nav, .menu"),
        ],
        TaskKind::Extract => &[
            ("content", "body, main, .content, .article"),
            ("title", "h1, .title, .headline"),
            ("text", "p, .text, .description"),
        ],
        // Every other task kind gets the search selector set.
        _ => &[
            (
                "search_box",
                "input[name=\"q\"], input[name=\"search\"], input[type=\"search\"]",
            ),
            (
                "search_button",
                "button[type=\"submit\"], input[type=\"submit\"], .search-button",
            ),
            ("results", ".result, .search-result, .product-item, .item"),
            ("title", "h1, h2, h3, .title, .name"),
            ("price", ".price, .cost, [class*=\"price\"]"),
            ("link", "a, .link"),
        ],
    };
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn default_actions(intent: &StructuredIntent) -> Vec<RawAction> {
    let url = intent.target_url.clone();
    match intent.task {
        TaskKind::Search => vec![
            RawAction {
                action: "goto".into(),
                url,
                ..Default::default()
            },
            RawAction {
                action: "fill".into(),
                selector: Some("input[name=\"q\"]".into()),
                value: Some(intent.query.clone()),
                ..Default::default()
            },
            RawAction {
                action: "click".into(),
                selector: Some("button[type=\"submit\"]".into()),
                ..Default::default()
            },
            RawAction {
                action: "wait".into(),
                timeout: Some(3),
                ..Default::default()
            },
            RawAction {
                action: "extract".into(),
                selector: Some(".result".into()),
                multiple: true,
                ..Default::default()
            },
        ],
        TaskKind::Navigate => vec![
            RawAction {
                action: "goto".into(),
                url,
                ..Default::default()
            },
            RawAction {
                action: "wait".into(),
                timeout: Some(2),
                ..Default::default()
            },
        ],
        TaskKind::Extract => vec![
            RawAction {
                action: "goto".into(),
                url,
                ..Default::default()
            },
            RawAction {
                action: "wait".into(),
                timeout: Some(2),
                ..Default::default()
            },
            RawAction {
                action: "extract".into(),
                selector: Some("body".into()),
                ..Default::default()
            },
        ],
        // The planner's per-task templates cover the remaining kinds.
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayStack, LlmBackend, LlmReply};
    use anyhow::bail;
    use async_trait::async_trait;

    struct Canned(String);

    #[async_trait]
    impl LlmBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn generate(&self, _prompt: &str) -> anyhow::Result<LlmReply> {
            Ok(LlmReply {
                content: self.0.clone(),
                model: "canned".into(),
                tokens_used: None,
                latency: None,
            })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl LlmBackend for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn generate(&self, _prompt: &str) -> anyhow::Result<LlmReply> {
            bail!("model offline")
        }
    }

    fn parser_with(content: &str) -> IntentParser {
        IntentParser::new(Arc::new(GatewayStack::new(vec![Box::new(Canned(
            content.to_string(),
        ))])))
    }

    #[tokio::test]
    async fn parses_model_json() {
        let parser = parser_with(
            r#"{"task": "search", "query": "laptops under 50000", "filters": {"price_max": 50000}, "count": 5, "fields": ["title", "price", "url"], "actions": []}"#,
        );
        let outcome = parser
            .parse("search laptops under ₹50,000", &MemoryContext::default())
            .await;
        assert!(!outcome.is_fallback());
        let intent = outcome.into_intent();
        assert_eq!(intent.task, TaskKind::Search);
        assert_eq!(intent.query, "laptops under 50000");
        assert_eq!(intent.filters.price_max, Some(50000.0));
        assert!(!intent.selectors.is_empty());
        assert!(!intent.actions.is_empty());
    }

    #[tokio::test]
    async fn extracts_json_from_fenced_block() {
        let parser = parser_with(
            "Here you go:\n```json\n{\"task\": \"navigate\", \"target_url\": \"https://example.org\"}\n```",
        );
        let intent = parser
            .parse("go to example.org", &MemoryContext::default())
            .await
            .into_intent();
        assert_eq!(intent.task, TaskKind::Navigate);
        assert_eq!(intent.target_url.as_deref(), Some("https://example.org"));
    }

    #[tokio::test]
    async fn falls_back_when_model_output_is_garbage() {
        let parser = parser_with("sorry, I cannot help with that");
        let outcome = parser
            .parse("search for mechanical keyboards", &MemoryContext::default())
            .await;
        assert!(outcome.is_fallback());
        assert_eq!(outcome.intent().task, TaskKind::Search);
    }

    #[tokio::test]
    async fn falls_back_when_gateway_errors() {
        let parser = IntentParser::new(Arc::new(GatewayStack::new(vec![Box::new(AlwaysFails)])));

        let outcome = parser
            .parse("search cheap monitors", &MemoryContext::default())
            .await;
        assert!(outcome.is_fallback());
        let intent = outcome.into_intent();
        assert_eq!(intent.task, TaskKind::Search);
        assert_eq!(intent.count, 5);
        assert!(!intent.selectors.is_empty());
        assert!(!intent.actions.is_empty());

        let nav = parser
            .parse("go to https://example.com", &MemoryContext::default())
            .await
            .into_intent();
        assert_eq!(nav.task, TaskKind::Navigate);

        let form = parser
            .parse("fill the contact form", &MemoryContext::default())
            .await
            .into_intent();
        assert_eq!(form.task, TaskKind::FillForm);
    }

    #[test]
    fn validate_fills_defaults_for_every_task_kind() {
        for task in [
            TaskKind::Search,
            TaskKind::Navigate,
            TaskKind::Extract,
            TaskKind::FillForm,
            TaskKind::Click,
            TaskKind::Screenshot,
        ] {
            let intent = validate(StructuredIntent {
                task,
                query: String::new(),
                filters: Filters::default(),
                count: 5,
                fields: vec![],
                target_url: None,
                selectors: HashMap::new(),
                actions: Vec::new(),
                raw_instruction: "do something".into(),
            });
            assert_eq!(intent.query, "do something");
            assert!(intent.target_url.is_some());
            assert!(!intent.selectors.is_empty(), "selectors empty for {task}");
        }
    }
}
