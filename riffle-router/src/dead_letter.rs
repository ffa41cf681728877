//! Dead-letter queues: the durable record of changes a pipeline gave up
//! on.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use riffle_data::Change;
use riffle_errors::{RiffleError, RiffleResult, WriteErrorKind};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// One abandoned change, with everything an operator needs to replay or
/// discard it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Hex rendering of the change fingerprint.
    pub fingerprint: String,
    pub change: Change,
    pub last_error_kind: WriteErrorKind,
    pub last_error_detail: String,
    /// Total delivery attempts, including the first.
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Append-only per-pipeline storage of dead-lettered records.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, pipeline: &str, record: DeadLetterRecord) -> RiffleResult<()>;
}

/// JSON-lines files, one per pipeline, under a configured directory.
pub struct FileDeadLetterStore {
    dir: PathBuf,
}

impl FileDeadLetterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileDeadLetterStore { dir: dir.into() }
    }

    fn path_for(&self, pipeline: &str) -> PathBuf {
        // Pipeline names are operator-chosen; keep the file name tame.
        let safe: String = pipeline
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Read back every record for a pipeline. Operator tooling and tests.
    pub async fn read_all(&self, pipeline: &str) -> RiffleResult<Vec<DeadLetterRecord>> {
        let path = self.path_for(pipeline);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| RiffleError::Serialization(format!("dead-letter record: {e}")))
            })
            .collect()
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn append(&self, pipeline: &str, record: DeadLetterRecord) -> RiffleResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| RiffleError::Serialization(format!("dead-letter record: {e}")))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(pipeline))
            .await?;
        file.write_all(&line).await?;
        // Durable before the call returns.
        file.sync_data().await?;
        Ok(())
    }
}

/// In-process store for tests.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    records: Mutex<HashMap<String, Vec<DeadLetterRecord>>>,
}

impl MemoryDeadLetterStore {
    pub fn records(&self, pipeline: &str) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .get(pipeline)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, pipeline: &str, record: DeadLetterRecord) -> RiffleResult<()> {
        self.records
            .lock()
            .entry(pipeline.to_owned())
            .or_default()
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use riffle_data::{fingerprint, ChangeMeta, ChangeOp, Row, TableIdent, Value};
    use riffle_position::Position;

    use super::*;

    fn record() -> DeadLetterRecord {
        let after: Row = [("id".to_owned(), Value::Int(7))].into_iter().collect();
        let change = Change::new(
            ChangeOp::Insert,
            TableIdent::new("app", "public", "orders"),
            None,
            Some(after),
            ChangeMeta::default(),
            Position::from_bytes(vec![1]),
        )
        .unwrap();
        DeadLetterRecord {
            fingerprint: hex::encode(fingerprint(&change)),
            change,
            last_error_kind: WriteErrorKind::SchemaMismatch,
            last_error_detail: "column \"surprise\" does not exist".into(),
            attempts: 1,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeadLetterStore::new(dir.path());
        store.append("orders-backup", record()).await.unwrap();
        store.append("orders-backup", record()).await.unwrap();

        let records = store.read_all("orders-backup").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempts, 1);
        assert_eq!(
            records[0].last_error_kind,
            WriteErrorKind::SchemaMismatch
        );
        // Other pipelines are untouched.
        assert!(store.read_all("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_keeps_records_per_pipeline() {
        let store = MemoryDeadLetterStore::default();
        store.append("a", record()).await.unwrap();
        assert_eq!(store.records("a").len(), 1);
        assert!(store.records("b").is_empty());
    }
}
