//! Narrow write interface to the indices ML persists into.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Index that results and data counts for all jobs are written to.
pub const SHARED_RESULTS_INDEX: &str = ".ml-anomalies-shared";

/// Writes documents to an index.
#[async_trait]
pub trait ResultsWriter: Send + Sync {
    async fn write(&self, index: &str, document: Value) -> Result<()>;
}

/// Keeps written documents in memory.
#[derive(Debug, Default)]
pub struct InMemoryResultsWriter {
    documents: Mutex<HashMap<String, Vec<Value>>>,
}

impl InMemoryResultsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents written to `index`, oldest first.
    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.documents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(index)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultsWriter for InMemoryResultsWriter {
    async fn write(&self, index: &str, document: Value) -> Result<()> {
        self.documents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(index.to_string())
            .or_default()
            .push(document);
        Ok(())
    }
}

/// Appends each document as a JSON line to `<dir>/<index>.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonLinesResultsWriter {
    dir: PathBuf,
}

impl JsonLinesResultsWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ResultsWriter for JsonLinesResultsWriter {
    async fn write(&self, index: &str, document: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.dir.join(format!("{index}.jsonl"));
        let mut line = serde_json::to_vec(&document)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_writer_groups_by_index() {
        let writer = InMemoryResultsWriter::new();
        writer.write("a", json!({"n": 1})).await.unwrap();
        writer.write("b", json!({"n": 2})).await.unwrap();
        writer.write("a", json!({"n": 3})).await.unwrap();

        assert_eq!(writer.documents("a"), vec![json!({"n": 1}), json!({"n": 3})]);
        assert!(writer.documents("c").is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonLinesResultsWriter::new(dir.path().join("results"));

        writer.write(SHARED_RESULTS_INDEX, json!({"n": 1})).await.unwrap();
        writer.write(SHARED_RESULTS_INDEX, json!({"n": 2})).await.unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("results/.ml-anomalies-shared.jsonl")).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"n": 1}), json!({"n": 2})]);
    }
}
