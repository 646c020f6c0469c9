use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::gateway::GatewayStack;
use crate::memory::SessionMemory;
use crate::normalizer::ContentNormalizer;
use crate::parser::IntentParser;
use crate::planner::StepPlanner;
use crate::session::{BrowsingSession, ChromeSessionProvider, SessionProvider};
use crate::storage::TaskStore;
use crate::types::{
    ActionKind, ExecutionResult, ExtractedRecord, LogEntry, LogLevel, PlanStep, StepOutcome,
    StructuredIntent, TaskStatus,
};

/// Structured log attached to a single task, mirrored to tracing.
struct TaskLog {
    task_id: String,
    entries: Vec<LogEntry>,
}

impl TaskLog {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, level: LogLevel, message: impl Into<String>, data: Value) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(task_id = %self.task_id, "{message}"),
            LogLevel::Warning => warn!(task_id = %self.task_id, "{message}"),
            LogLevel::Error => error!(task_id = %self.task_id, "{message}"),
        }
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
            data,
        });
    }

    fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message, json!({}));
    }
}

/// What a plan run produced: the records collected so far and whether a
/// critical step failure cut the plan short.
struct PlanRun {
    records: Vec<ExtractedRecord>,
    aborted: bool,
}

/// Drives the whole pipeline: parse, plan, execute, normalize, persist.
/// `execute` never returns an error; every failure mode is folded into the
/// returned result's status and log.
pub struct Engine {
    parser: IntentParser,
    planner: StepPlanner,
    normalizer: ContentNormalizer,
    sessions: Box<dyn SessionProvider>,
    store: TaskStore,
    memory: Mutex<SessionMemory>,
}

impl Engine {
    pub fn new(
        gateway: Arc<GatewayStack>,
        sessions: Box<dyn SessionProvider>,
        store: TaskStore,
        memory: SessionMemory,
    ) -> Self {
        Self {
            parser: IntentParser::new(gateway),
            planner: StepPlanner::new(),
            normalizer: ContentNormalizer::new(),
            sessions,
            store,
            memory: Mutex::new(memory),
        }
    }

    /// Wire up the production engine from environment configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let gateway = Arc::new(GatewayStack::from_config(config));
        let store = TaskStore::new(&config.output_dir)?;
        let sessions = Box::new(ChromeSessionProvider::new(
            config.headless,
            store.screenshots_dir(),
        ));
        let memory = if config.persist_memory {
            SessionMemory::load(config.memory_file.clone())
        } else {
            SessionMemory::in_memory()
        };
        Ok(Self::new(gateway, sessions, store, memory))
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub async fn memory(&self) -> tokio::sync::MutexGuard<'_, SessionMemory> {
        self.memory.lock().await
    }

    /// Run one instruction end to end. The returned result always carries a
    /// task id, a status, the structured log, and has been recorded in both
    /// session memory and the task store.
    pub async fn execute(&self, instruction: &str, task_id: Option<String>) -> ExecutionResult {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut log = TaskLog::new(&task_id);
        log.push(
            LogLevel::Info,
            "task started",
            json!({"instruction": instruction}),
        );

        let context = self.memory.lock().await.context_for(instruction);
        let parsed = self.parser.parse(instruction, &context).await;
        if parsed.is_fallback() {
            log.push(
                LogLevel::Warning,
                "model parse failed, intent built from keyword heuristics",
                json!({}),
            );
        }
        let intent = parsed.into_intent();
        log.push(
            LogLevel::Info,
            format!("interpreted as {} task", intent.task),
            json!({"query": intent.query.clone(), "count": intent.count}),
        );

        let planned = self.planner.plan(&intent);
        if planned.is_fallback() {
            log.push(LogLevel::Warning, "planning failed, using fallback plan", json!({}));
        }
        let steps = planned.into_steps();
        log.info(format!("plan ready with {} steps", steps.len()));
        let wants_extraction = steps.iter().any(|s| s.action == ActionKind::Extract);

        let (status, records, error_message) = match self.sessions.open().await {
            Ok(mut session) => {
                let run = self.drive_plan(session.as_mut(), &steps, &mut log).await;
                if let Err(err) = session.close().await {
                    log.push(
                        LogLevel::Warning,
                        format!("session close failed: {err:#}"),
                        json!({}),
                    );
                }
                self.settle(run, &intent, wants_extraction, &mut log)
            }
            Err(err) => {
                let message = format!("could not open browser session: {err:#}");
                log.push(LogLevel::Error, message.clone(), json!({}));
                (TaskStatus::Error, Vec::new(), Some(message))
            }
        };

        let result = ExecutionResult {
            task_id,
            status,
            instruction: instruction.to_string(),
            records,
            started_at,
            execution_time: clock.elapsed().as_secs_f64(),
            error_message,
            log: log.entries,
            metadata: json!({
                "task": intent.task.as_str(),
                "query": intent.query.clone(),
            }),
        };
        self.record(&intent, &result).await;
        result
    }

    /// Execute the plan step by step. A critical step that exhausts its
    /// retries aborts the remainder; a non-critical one is logged and skipped.
    async fn drive_plan(
        &self,
        session: &mut dyn BrowsingSession,
        steps: &[PlanStep],
        log: &mut TaskLog,
    ) -> PlanRun {
        let mut records = Vec::new();

        for (i, step) in steps.iter().enumerate() {
            let number = i + 1;
            let outcome = self.run_with_retry(session, step, number, log).await;

            if outcome.success {
                log.push(
                    LogLevel::Info,
                    format!("step {number} ({}) succeeded", step.action),
                    json!({"artifact": outcome.artifact}),
                );
                if step.action == ActionKind::Extract {
                    if let Some(payload) = outcome.payload {
                        let fragments = payload.into_fragments();
                        let batch = self.normalizer.normalize(&fragments);
                        log.info(format!(
                            "normalized {} fragments into {} records",
                            fragments.len(),
                            batch.len()
                        ));
                        records.extend(batch);
                    }
                }
                continue;
            }

            let reason = outcome.error.unwrap_or_else(|| "unknown failure".into());
            if step.action.is_critical() {
                log.push(
                    LogLevel::Error,
                    format!("step {number} ({}) failed, aborting remaining plan", step.action),
                    json!({"error": reason}),
                );
                return PlanRun {
                    records,
                    aborted: true,
                };
            }
            log.push(
                LogLevel::Warning,
                format!("step {number} ({}) failed, continuing", step.action),
                json!({"error": reason}),
            );
        }

        PlanRun {
            records,
            aborted: false,
        }
    }

    /// Run one step up to its retry budget, pausing briefly between attempts.
    async fn run_with_retry(
        &self,
        session: &mut dyn BrowsingSession,
        step: &PlanStep,
        number: usize,
        log: &mut TaskLog,
    ) -> StepOutcome {
        let attempts = step.retries.max(1);
        for attempt in 1..attempts {
            let outcome = run_step(session, step).await;
            if outcome.success {
                return outcome;
            }
            log.push(
                LogLevel::Warning,
                format!(
                    "step {number} ({}) attempt {attempt}/{attempts} failed, retrying",
                    step.action
                ),
                json!({"error": outcome.error}),
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        run_step(session, step).await
    }

    /// Run the aggregate normalization pass and derive the task status.
    fn settle(
        &self,
        run: PlanRun,
        intent: &StructuredIntent,
        wants_extraction: bool,
        log: &mut TaskLog,
    ) -> (TaskStatus, Vec<ExtractedRecord>, Option<String>) {
        let collected = run.records.len();
        let mut records = self
            .normalizer
            .deduplicate(run.records, &["title", "url"]);
        records = self.normalizer.filter_by_price(
            records,
            intent.filters.price_min,
            intent.filters.price_max,
        );
        if let Some(sort) = intent.filters.sort {
            records = self.normalizer.sort_by(records, sort);
        }
        records = self.normalizer.limit(records, intent.count);
        log.info(format!(
            "aggregated {collected} records into {} after dedup, filters and limit",
            records.len()
        ));

        if run.aborted {
            if records.is_empty() {
                let message = "a critical step failed before any content was extracted".to_string();
                return (TaskStatus::Error, records, Some(message));
            }
            let message = "a critical step failed after partial extraction".to_string();
            return (TaskStatus::Partial, records, Some(message));
        }
        if wants_extraction && records.is_empty() {
            let message = "extraction completed but produced no usable records".to_string();
            return (TaskStatus::Error, records, Some(message));
        }
        (TaskStatus::Success, records, None)
    }

    /// Always record the finished task in session memory and the task store,
    /// whatever its status.
    async fn record(&self, intent: &StructuredIntent, result: &ExecutionResult) {
        let success = result.status == TaskStatus::Success;
        let task_kind = if result.status == TaskStatus::Error {
            "error"
        } else {
            intent.task.as_str()
        };
        let payload = if result.records.is_empty() {
            match &result.error_message {
                Some(msg) => json!({"error": msg}),
                None => json!({"records": 0}),
            }
        } else {
            serde_json::to_value(&result.records).unwrap_or_else(|_| json!({}))
        };

        self.memory.lock().await.add(
            &result.instruction,
            payload,
            success,
            task_kind,
            json!({"task_id": result.task_id, "status": result.status.as_str()}),
        );

        if let Err(err) = self.store.save(result) {
            warn!(task_id = %result.task_id, error = %err, "failed to persist task result");
        }
    }
}

/// Dispatch one plan step to the session primitive it names. Missing
/// parameters are step failures, not panics.
async fn run_step(session: &mut dyn BrowsingSession, step: &PlanStep) -> StepOutcome {
    let timeout = Duration::from_secs(step.timeout);
    match step.action {
        ActionKind::Goto => match &step.url {
            Some(url) => session.goto(url, timeout).await,
            None => StepOutcome::failure("goto step has no url"),
        },
        ActionKind::Click => match &step.selector {
            Some(selector) => session.click(selector, timeout).await,
            None => StepOutcome::failure("click step has no selector"),
        },
        ActionKind::Fill => match (&step.selector, &step.value) {
            (Some(selector), Some(value)) => session.fill(selector, value, timeout).await,
            _ => StepOutcome::failure("fill step needs a selector and a value"),
        },
        ActionKind::Extract => match &step.selector {
            Some(selector) => session.extract(selector, step.multiple, timeout).await,
            None => StepOutcome::failure("extract step has no selector"),
        },
        ActionKind::Wait => session.wait(step.timeout).await,
        ActionKind::Screenshot => {
            let name = step.metadata.get("name").and_then(|v| v.as_str());
            session.screenshot(name).await
        }
    }
}
