use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{ExecutionResult, ExtractedRecord};

/// One line of the task history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: String,
    pub instruction: String,
    pub timestamp: DateTime<Utc>,
    pub execution_time: f64,
    pub result_count: usize,
    pub path: PathBuf,
}

/// Durable store for execution results: one JSON file and one CSV file per
/// task under the output directory, plus ad-hoc record exports.
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["json", "csv", "screenshots"] {
            std::fs::create_dir_all(root.join(sub))
                .with_context(|| format!("creating output directory {}", root.display()))?;
        }
        Ok(Self { root })
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.root.join("screenshots")
    }

    /// Persist a result in both formats, returning the written paths.
    pub fn save(&self, result: &ExecutionResult) -> Result<Vec<PathBuf>> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let stem = format!("task_{}_{stamp}", result.task_id);

        let json_path = self.root.join("json").join(format!("{stem}.json"));
        let file = File::create(&json_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), result)?;

        let csv_path = self.root.join("csv").join(format!("{stem}.csv"));
        self.write_result_csv(&csv_path, result)?;

        info!(task_id = %result.task_id, "saved task result");
        Ok(vec![json_path, csv_path])
    }

    fn write_result_csv(&self, path: &Path, result: &ExecutionResult) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        if result.records.is_empty() {
            writer.write_record(["task_id", "status", "instruction", "timestamp", "execution_time"])?;
            writer.write_record([
                result.task_id.as_str(),
                result.status.as_str(),
                result.instruction.as_str(),
                &result.started_at.to_rfc3339(),
                &result.execution_time.to_string(),
            ])?;
        } else {
            writer.write_record([
                "title",
                "price",
                "url",
                "description",
                "rating",
                "image_url",
                "task_id",
                "status",
            ])?;
            for record in &result.records {
                writer.write_record([
                    record.title.as_deref().unwrap_or(""),
                    record.price.as_deref().unwrap_or(""),
                    record.url.as_deref().unwrap_or(""),
                    record.description.as_deref().unwrap_or(""),
                    record.rating.as_deref().unwrap_or(""),
                    record.image_url.as_deref().unwrap_or(""),
                    result.task_id.as_str(),
                    result.status.as_str(),
                ])?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Load a result by task id from its JSON copy.
    pub fn load(&self, task_id: &str) -> Result<Option<ExecutionResult>> {
        let prefix = format!("task_{task_id}_");
        for entry in std::fs::read_dir(self.root.join("json"))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                let file = File::open(entry.path())?;
                let result = serde_json::from_reader(BufReader::new(file))?;
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Summaries of every saved result, newest first.
    pub fn list(&self) -> Result<Vec<TaskSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(self.root.join("json"))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable result file");
                    continue;
                }
            };
            match serde_json::from_reader::<_, ExecutionResult>(BufReader::new(file)) {
                Ok(result) => summaries.push(TaskSummary {
                    task_id: result.task_id,
                    status: result.status.to_string(),
                    instruction: result.instruction,
                    timestamp: result.started_at,
                    execution_time: result.execution_time,
                    result_count: result.records.len(),
                    path,
                }),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping malformed result file")
                }
            }
        }
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(summaries)
    }

    pub fn export_json(&self, records: &[ExtractedRecord], filename: &str) -> Result<PathBuf> {
        let path = self.root.join("json").join(filename);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), records)?;
        Ok(path)
    }

    pub fn export_csv(&self, records: &[ExtractedRecord], filename: &str) -> Result<PathBuf> {
        let path = self.root.join("csv").join(filename);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["title", "price", "url", "description", "rating", "image_url"])?;
        for record in records {
            writer.write_record([
                record.title.as_deref().unwrap_or(""),
                record.price.as_deref().unwrap_or(""),
                record.url.as_deref().unwrap_or(""),
                record.description.as_deref().unwrap_or(""),
                record.rating.as_deref().unwrap_or(""),
                record.image_url.as_deref().unwrap_or(""),
            ])?;
        }
        writer.flush()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use serde_json::json;

    fn sample_result(task_id: &str) -> ExecutionResult {
        ExecutionResult {
            task_id: task_id.to_string(),
            status: TaskStatus::Success,
            instruction: "search laptops".into(),
            records: vec![ExtractedRecord {
                title: Some("Laptop".into()),
                price: Some("₹45,000".into()),
                url: Some("https://example.com/1".into()),
                ..Default::default()
            }],
            started_at: Utc::now(),
            execution_time: 1.25,
            error_message: None,
            log: Vec::new(),
            metadata: json!({}),
        }
    }

    #[test]
    fn save_load_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).unwrap();

        let paths = store.save(&sample_result("abc123")).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.exists()));

        let loaded = store.load("abc123").unwrap().expect("result present");
        assert_eq!(loaded.task_id, "abc123");
        assert_eq!(loaded.records.len(), 1);

        assert!(store.load("missing").unwrap().is_none());

        let listing = store.list().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].result_count, 1);
        assert_eq!(listing[0].status, "success");
    }

    #[test]
    fn empty_results_still_produce_a_csv() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).unwrap();
        let mut result = sample_result("empty1");
        result.records.clear();
        result.status = TaskStatus::Error;
        let paths = store.save(&result).unwrap();
        let csv = std::fs::read_to_string(&paths[1]).unwrap();
        assert!(csv.contains("empty1"));
        assert!(csv.contains("error"));
    }

    #[test]
    fn exports_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).unwrap();
        let records = sample_result("x").records;
        let csv_path = store.export_csv(&records, "out.csv").unwrap();
        let json_path = store.export_json(&records, "out.json").unwrap();
        assert!(std::fs::read_to_string(csv_path).unwrap().contains("Laptop"));
        assert!(std::fs::read_to_string(json_path).unwrap().contains("₹45,000"));
    }
}
