use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::MemoryEntry;

const MAX_ENTRIES: usize = 100;
const TTL_DAYS: i64 = 7;

/// Aggregate counters for the current session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    #[serde(default)]
    pub preferences: HashMap<String, Value>,
}

impl SessionContext {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            start_time: now,
            last_activity: now,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            preferences: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub success_rate: f64,
}

/// Context bundle handed to the intent parser for a new instruction.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub similar: Vec<MemoryEntry>,
    pub recent: Vec<MemoryEntry>,
    pub stats: Option<MemoryStats>,
    pub preferences: HashMap<String, Value>,
}

/// On-disk shape of the whole store.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedMemory {
    entries: Vec<MemoryEntry>,
    session: SessionContext,
}

/// Bounded, time-decayed store of past instructions and results. Retention
/// runs after every insert: entries older than the TTL are dropped, then the
/// store is capped to the most recent entries.
pub struct SessionMemory {
    entries: Vec<MemoryEntry>,
    session: SessionContext,
    path: Option<PathBuf>,
}

impl SessionMemory {
    /// In-process only store, used by tests and when persistence is disabled.
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            session: SessionContext::fresh(),
            path: None,
        }
    }

    /// Disk-backed store. A missing or unreadable file starts fresh.
    pub fn load(path: PathBuf) -> Self {
        match File::open(&path) {
            Ok(file) => match serde_json::from_reader::<_, PersistedMemory>(BufReader::new(file)) {
                Ok(persisted) => {
                    info!(entries = persisted.entries.len(), "loaded session memory");
                    return Self {
                        entries: persisted.entries,
                        session: persisted.session,
                        path: Some(path),
                    };
                }
                Err(err) => warn!(error = %err, "session memory file unreadable, starting fresh"),
            },
            Err(_) => debug!(path = %path.display(), "no session memory file yet"),
        }
        Self {
            entries: Vec::new(),
            session: SessionContext::fresh(),
            path: Some(path),
        }
    }

    /// Append an entry, update the counters, apply retention, persist.
    pub fn add(
        &mut self,
        instruction: &str,
        result: Value,
        success: bool,
        task_kind: &str,
        metadata: Value,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.entries.push(MemoryEntry {
            id: id.clone(),
            instruction: instruction.to_string(),
            result,
            timestamp: Utc::now(),
            task_kind: task_kind.to_string(),
            success,
            metadata,
        });

        self.session.total_tasks += 1;
        if success {
            self.session.successful_tasks += 1;
        } else {
            self.session.failed_tasks += 1;
        }
        self.session.last_activity = Utc::now();

        self.apply_retention();
        self.save();
        id
    }

    fn apply_retention(&mut self) {
        let cutoff = Utc::now() - Duration::days(TTL_DAYS);
        self.entries.retain(|e| e.timestamp > cutoff);

        // Entries are appended in time order, so the oldest sit at the front.
        if self.entries.len() > MAX_ENTRIES {
            let excess = self.entries.len() - MAX_ENTRIES;
            self.entries.drain(0..excess);
        }
    }

    /// Newest first. Entries are stored in time order, so this is a walk
    /// from the back.
    pub fn recent(&self, limit: usize) -> Vec<MemoryEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn by_kind(&self, task_kind: &str) -> Vec<MemoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.task_kind == task_kind)
            .cloned()
            .collect()
    }

    /// Top-`limit` entries by Jaccard similarity of lowercased word sets,
    /// nonzero scores only. Ties keep insertion order.
    pub fn find_similar(&self, instruction: &str, limit: usize) -> Vec<MemoryEntry> {
        let query = word_set(instruction);
        if query.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, &MemoryEntry)> = self
            .entries
            .iter()
            .map(|e| (jaccard(&query, &word_set(&e.instruction)), e))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, e)| e.clone()).collect()
    }

    pub fn context_for(&self, instruction: &str) -> MemoryContext {
        MemoryContext {
            similar: self.find_similar(instruction, 3),
            recent: self.recent(5),
            stats: Some(self.stats()),
            preferences: self.session.preferences.clone(),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let s = &self.session;
        MemoryStats {
            session_id: s.session_id.clone(),
            start_time: s.start_time,
            last_activity: s.last_activity,
            total_tasks: s.total_tasks,
            successful_tasks: s.successful_tasks,
            failed_tasks: s.failed_tasks,
            success_rate: if s.total_tasks > 0 {
                s.successful_tasks as f64 / s.total_tasks as f64
            } else {
                0.0
            },
        }
    }

    pub fn preferences(&self) -> &HashMap<String, Value> {
        &self.session.preferences
    }

    pub fn update_preferences(&mut self, preferences: HashMap<String, Value>) {
        self.session.preferences.extend(preferences);
        self.save();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.session.total_tasks = 0;
        self.session.successful_tasks = 0;
        self.session.failed_tasks = 0;
        self.save();
        info!("cleared session memory");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let persisted = PersistedMemory {
            entries: self.entries.clone(),
            session: self.session.clone(),
        };
        match File::create(path) {
            Ok(file) => {
                if let Err(err) = serde_json::to_writer_pretty(BufWriter::new(file), &persisted) {
                    warn!(error = %err, "failed to write session memory");
                }
            }
            Err(err) => warn!(error = %err, "failed to create session memory file"),
        }
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_then_recent_returns_the_entry_first() {
        let mut memory = SessionMemory::in_memory();
        memory.add("search laptops", json!({"count": 2}), true, "search", json!({}));
        let id = memory.add("navigate to example.com", json!({}), true, "navigate", json!({}));
        let recent = memory.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, id);
        assert_eq!(recent[0].instruction, "navigate to example.com");
    }

    #[test]
    fn find_similar_scores_by_word_overlap() {
        let mut memory = SessionMemory::in_memory();
        memory.add("search laptops under 50000", json!({}), true, "search", json!({}));
        memory.add("take a screenshot of example.com", json!({}), true, "screenshot", json!({}));
        let similar = memory.find_similar("search for laptops", 3);
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].task_kind, "search");
        assert!(memory.find_similar("completely unrelated words", 3).is_empty());
        assert_eq!(memory.by_kind("screenshot").len(), 1);
    }

    #[test]
    fn stats_track_success_rate() {
        let mut memory = SessionMemory::in_memory();
        assert_eq!(memory.stats().success_rate, 0.0);
        memory.add("a", json!({}), true, "search", json!({}));
        memory.add("b", json!({}), false, "error", json!({}));
        let stats = memory.stats();
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.successful_tasks, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn retention_caps_the_entry_count() {
        let mut memory = SessionMemory::in_memory();
        for i in 0..(MAX_ENTRIES + 20) {
            memory.add(&format!("task {i}"), json!({}), true, "search", json!({}));
        }
        assert_eq!(memory.len(), MAX_ENTRIES);
        // The newest entry survives the cap.
        let recent = memory.recent(1);
        assert_eq!(recent[0].instruction, format!("task {}", MAX_ENTRIES + 19));
    }

    #[test]
    fn clear_resets_counters() {
        let mut memory = SessionMemory::in_memory();
        memory.add("a", json!({}), true, "search", json!({}));
        memory.clear();
        assert!(memory.is_empty());
        assert_eq!(memory.stats().total_tasks, 0);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");

        let mut memory = SessionMemory::load(path.clone());
        memory.add("search laptops", json!({"items": 3}), true, "search", json!({}));
        let session_id = memory.stats().session_id.clone();

        let reloaded = SessionMemory::load(path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.stats().session_id, session_id);
        assert_eq!(reloaded.recent(1)[0].instruction, "search laptops");
    }

    #[test]
    fn context_bundles_similar_and_recent() {
        let mut memory = SessionMemory::in_memory();
        for i in 0..8 {
            memory.add(&format!("search item {i}"), json!({}), true, "search", json!({}));
        }
        let context = memory.context_for("search item 3");
        assert_eq!(context.similar.len(), 3);
        assert_eq!(context.recent.len(), 5);
        assert_eq!(context.stats.unwrap().total_tasks, 8);
    }
}
