use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of task an instruction resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Search,
    Navigate,
    Extract,
    FillForm,
    Click,
    Screenshot,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Search => "search",
            TaskKind::Navigate => "navigate",
            TaskKind::Extract => "extract",
            TaskKind::FillForm => "fill_form",
            TaskKind::Click => "click",
            TaskKind::Screenshot => "screenshot",
        }
    }

    pub fn parse(s: &str) -> Option<TaskKind> {
        match s {
            "search" => Some(TaskKind::Search),
            "navigate" => Some(TaskKind::Navigate),
            "extract" => Some(TaskKind::Extract),
            "fill_form" => Some(TaskKind::FillForm),
            "click" => Some(TaskKind::Click),
            "screenshot" => Some(TaskKind::Screenshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A primitive browser action a plan step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Goto,
    Click,
    Fill,
    Extract,
    Wait,
    Screenshot,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Goto => "goto",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Extract => "extract",
            ActionKind::Wait => "wait",
            ActionKind::Screenshot => "screenshot",
        }
    }

    pub fn parse(s: &str) -> Option<ActionKind> {
        match s {
            "goto" => Some(ActionKind::Goto),
            "click" => Some(ActionKind::Click),
            "fill" => Some(ActionKind::Fill),
            "extract" => Some(ActionKind::Extract),
            "wait" => Some(ActionKind::Wait),
            "screenshot" => Some(ActionKind::Screenshot),
            _ => None,
        }
    }

    /// Failure of a critical action halts the remaining plan.
    pub fn is_critical(&self) -> bool {
        matches!(self, ActionKind::Goto | ActionKind::Click)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter options carried by an intent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Rating,
    Price,
}

/// One primitive action as emitted by the language model, before planning
/// turns it into a [`PlanStep`]. The `action` field stays a free string so
/// a malformed model response surfaces as a planning failure, not a parse
/// failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Structured interpretation of a natural-language instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredIntent {
    pub task: TaskKind,
    pub query: String,
    pub filters: Filters,
    pub count: usize,
    pub fields: Vec<String>,
    pub target_url: Option<String>,
    pub selectors: HashMap<String, String>,
    pub actions: Vec<RawAction>,
    pub raw_instruction: String,
}

/// One executable browser action with parameters, timeout and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: ActionKind,
    pub selector: Option<String>,
    pub value: Option<String>,
    pub url: Option<String>,
    /// Timeout in seconds.
    pub timeout: u64,
    pub multiple: bool,
    pub retries: u32,
    pub metadata: HashMap<String, Value>,
}

impl PlanStep {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            selector: None,
            value: None,
            url: None,
            timeout: 10,
            multiple: false,
            retries: 3,
            metadata: HashMap::new(),
        }
    }
}

/// One raw piece of extracted page content prior to normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawFragment {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl RawFragment {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Payload carried by a successful step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepPayload {
    Fragment(RawFragment),
    Fragments(Vec<RawFragment>),
    Info(Value),
}

impl StepPayload {
    pub fn into_fragments(self) -> Vec<RawFragment> {
        match self {
            StepPayload::Fragment(f) => vec![f],
            StepPayload::Fragments(fs) => fs,
            StepPayload::Info(_) => Vec::new(),
        }
    }
}

/// Outcome of a single executed step. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub payload: Option<StepPayload>,
    pub error: Option<String>,
    pub artifact: Option<PathBuf>,
    pub metadata: HashMap<String, Value>,
}

impl StepOutcome {
    pub fn ok(payload: Option<StepPayload>) -> Self {
        Self {
            success: true,
            payload,
            error: None,
            artifact: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            artifact: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Normalized, structured output unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub title: Option<String>,
    pub price: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub rating: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

impl ExtractedRecord {
    /// A record is worth keeping only if at least one primary field is set.
    pub fn is_meaningful(&self) -> bool {
        self.title.is_some()
            || self.price.is_some()
            || self.url.is_some()
            || self.description.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Error,
    Partial,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Partial => "partial",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One entry of the structured log attached to an execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Complete result of one `execute` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub instruction: String,
    pub records: Vec<ExtractedRecord>,
    pub started_at: DateTime<Utc>,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    pub error_message: Option<String>,
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub metadata: Value,
}

/// One retained piece of task history inside session memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub instruction: String,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
    pub task_kind: String,
    pub success: bool,
    #[serde(default)]
    pub metadata: Value,
}
