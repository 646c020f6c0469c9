//! Natural-language browser automation: instructions are parsed into a
//! structured intent, planned as an ordered list of browser actions, executed
//! against a live session with per-step retries, and normalized into
//! structured records that land in session memory and the task store.

pub mod config;
pub mod engine;
pub mod gateway;
pub mod memory;
pub mod normalizer;
pub mod parser;
pub mod planner;
pub mod session;
pub mod storage;
pub mod types;

pub use config::Config;
pub use engine::Engine;
pub use gateway::{GatewayStack, LlmBackend, LlmReply};
pub use memory::{MemoryContext, SessionMemory};
pub use normalizer::ContentNormalizer;
pub use parser::{IntentParser, ParseOutcome};
pub use planner::{PlanOutcome, StepPlanner};
pub use session::{BrowsingSession, ChromeSessionProvider, SessionProvider};
pub use storage::TaskStore;
pub use types::{
    ActionKind, ExecutionResult, ExtractedRecord, PlanStep, StructuredIntent, TaskKind, TaskStatus,
};
