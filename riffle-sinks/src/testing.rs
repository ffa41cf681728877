//! In-memory sink for tests of the router, retry controller, and
//! supervisor. Keeps tables as key-indexed maps and supports scripted
//! per-write failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use riffle_data::{key_of, Change, ChangeOp, Row, SinkStats};
use riffle_errors::{RiffleResult, WriteErrorKind};

use crate::{BatchItem, SinkHealth, SinkState, SinkWriter, WriteResult};

type Table = BTreeMap<String, Row>;

/// Shared state of a [`MemorySink`], kept behind an `Arc` so tests can
/// inspect it and so it survives a simulated restart of the sink.
#[derive(Debug, Default)]
pub struct MemorySinkState {
    tables: Mutex<HashMap<String, Table>>,
    /// Error kinds to inject, one per upcoming write, front first.
    scripted_failures: Mutex<VecDeque<WriteErrorKind>>,
    applied: Mutex<Vec<(ChangeOp, String)>>,
}

impl MemorySinkState {
    fn render_key(key: &Row) -> String {
        serde_json::to_string(key).expect("rows are serializable")
    }

    /// Queue an error kind to be returned by the next write.
    pub fn inject_failure(&self, kind: WriteErrorKind) {
        self.scripted_failures.lock().push_back(kind);
    }

    /// The row currently stored under the given key, if any.
    pub fn row(&self, table: &str, key: &Row) -> Option<Row> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.get(&Self::render_key(key)))
            .cloned()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.len())
    }

    /// `(op, table)` log of every write that reached table state.
    pub fn applied(&self) -> Vec<(ChangeOp, String)> {
        self.applied.lock().clone()
    }
}

/// A [`SinkWriter`] over in-process state, for tests.
pub struct MemorySink {
    name: String,
    stats: Arc<SinkStats>,
    state: Arc<MemorySinkState>,
    lifecycle: SinkState,
}

impl MemorySink {
    pub fn new(name: &str, state: Arc<MemorySinkState>, stats: Arc<SinkStats>) -> Self {
        MemorySink {
            name: name.to_owned(),
            stats,
            state,
            lifecycle: SinkState::Created,
        }
    }

    pub fn state(&self) -> Arc<MemorySinkState> {
        Arc::clone(&self.state)
    }

    fn write(&self, change: &Change, _upsert: bool) -> WriteResult {
        let started = Instant::now();
        let op = change.op();
        let key = match op {
            ChangeOp::Truncate => None,
            _ => Some(key_of(change)),
        };

        if let Some(kind) = self.state.scripted_failures.lock().pop_front() {
            let result = WriteResult::failed(
                op,
                key,
                kind,
                "scripted failure",
                started.elapsed().max(Duration::from_micros(1)),
            );
            self.stats.record_write(op, false, result.duration);
            return result;
        }

        let table_name = change.table().to_owned();
        let mut tables = self.state.tables.lock();
        let table = tables.entry(table_name.clone()).or_default();
        let rows_affected = match op {
            ChangeOp::Insert | ChangeOp::Update => {
                let rendered = MemorySinkState::render_key(key.as_ref().expect("keyed op"));
                table.insert(rendered, change.after().expect("validated image").clone());
                1
            }
            ChangeOp::Delete => {
                let rendered = MemorySinkState::render_key(key.as_ref().expect("keyed op"));
                u64::from(table.remove(&rendered).is_some())
            }
            ChangeOp::Truncate => {
                let n = table.len() as u64;
                table.clear();
                n
            }
            ChangeOp::Unknown => {
                drop(tables);
                let result = WriteResult::failed(
                    op,
                    key,
                    WriteErrorKind::SchemaMismatch,
                    "unknown op",
                    started.elapsed().max(Duration::from_micros(1)),
                );
                self.stats.record_write(op, false, result.duration);
                return result;
            }
        };
        drop(tables);

        self.state.applied.lock().push((op, table_name));
        let duration = started.elapsed().max(Duration::from_micros(1));
        self.stats.record_write(op, true, duration);
        WriteResult::ok(op, key, rows_affected, duration)
    }
}

#[async_trait]
impl SinkWriter for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> RiffleResult<()> {
        self.lifecycle = SinkState::Ready;
        self.stats.set_connected(true);
        Ok(())
    }

    async fn disconnect(&mut self) -> RiffleResult<()> {
        self.lifecycle = SinkState::Stopped;
        self.stats.set_connected(false);
        Ok(())
    }

    fn health(&self) -> SinkHealth {
        SinkHealth {
            state: self.lifecycle,
            connected: self.stats.is_connected(),
            last_write_time: self.stats.last_write_time(),
        }
    }

    fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    async fn apply(&mut self, change: &Change, upsert: bool) -> WriteResult {
        self.write(change, upsert)
    }

    async fn apply_batch(&mut self, batch: &[BatchItem]) -> Vec<WriteResult> {
        batch
            .iter()
            .map(|item| self.write(&item.change, item.upsert))
            .collect()
    }

    async fn delete(&mut self, table: &str, key: &Row) -> WriteResult {
        let started = Instant::now();
        let removed = self
            .state
            .tables
            .lock()
            .get_mut(table)
            .map_or(0, |t| u64::from(t.remove(&MemorySinkState::render_key(key)).is_some()));
        let duration = started.elapsed().max(Duration::from_micros(1));
        self.stats.record_write(ChangeOp::Delete, true, duration);
        WriteResult::ok(ChangeOp::Delete, Some(key.clone()), removed, duration)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use riffle_data::{ChangeMeta, TableIdent, Value};
    use riffle_position::Position;

    use super::*;

    fn row(cols: &[(&str, Value)]) -> Row {
        cols.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn change(op: ChangeOp, before: Option<Row>, after: Option<Row>, pos: u64) -> Change {
        Change::new(
            op,
            TableIdent::new("app", "public", "orders"),
            before,
            after,
            ChangeMeta::default(),
            Position::from_bytes(pos.to_be_bytes().to_vec()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_then_reinsert_is_idempotent() {
        let state = Arc::new(MemorySinkState::default());
        let mut sink = MemorySink::new("mem", Arc::clone(&state), Default::default());
        sink.connect().await.unwrap();

        let c = change(
            ChangeOp::Insert,
            None,
            Some(row(&[("id", Value::Int(7)), ("amount", Value::Int(100))])),
            1,
        );
        assert!(sink.apply(&c, false).await.success);
        assert!(sink.apply(&c, true).await.success);
        assert_eq!(state.row_count("orders"), 1);
    }

    #[tokio::test]
    async fn delete_missing_row_succeeds_with_zero_rows() {
        let state = Arc::new(MemorySinkState::default());
        let mut sink = MemorySink::new("mem", Arc::clone(&state), Default::default());
        sink.connect().await.unwrap();

        let c = change(
            ChangeOp::Delete,
            Some(row(&[("id", Value::Int(42))])),
            None,
            1,
        );
        let result = sink.apply(&c, false).await;
        assert!(result.success);
        assert_eq!(result.rows_affected, 0);
    }

    #[tokio::test]
    async fn scripted_failures_fire_in_order() {
        let state = Arc::new(MemorySinkState::default());
        state.inject_failure(WriteErrorKind::Transient);
        let mut sink = MemorySink::new("mem", Arc::clone(&state), Default::default());
        sink.connect().await.unwrap();

        let c = change(
            ChangeOp::Insert,
            None,
            Some(row(&[("id", Value::Int(1))])),
            1,
        );
        let first = sink.apply(&c, false).await;
        assert_eq!(first.error_kind, Some(WriteErrorKind::Transient));
        let second = sink.apply(&c, false).await;
        assert!(second.success);
    }
}
