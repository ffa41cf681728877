//! Sink writers: translate normalized changes into store-native write
//! operations, with batch coalescing and retry-safe upsert semantics.

pub mod batch;
mod document;
mod relational;
mod sql;
pub mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use riffle_data::{Change, ChangeOp, Row, SinkStats};
use riffle_errors::{RiffleError, RiffleResult, WriteErrorKind};
use serde::{Deserialize, Serialize};

pub use document::DocumentSink;
pub use relational::RelationalSink;
pub use sql::{quote_ident, resolve_table, Dialect};

/// How long a sink may take to acquire its connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a single write operation may take before it is reported as a
/// transient failure.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// The backend family of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Relational,
    Document,
}

/// Static configuration for one sink, as handed to the core already parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub connection_string: String,
    /// Target database name (document sinks; relational sinks take it from
    /// the connection string).
    #[serde(default)]
    pub database: Option<String>,
    /// SQL dialect for identifier quoting.
    #[serde(default)]
    pub dialect: Dialect,
    /// Explicit source-table to target-table overrides. Keys may be
    /// `schema.table` or bare `table`; the most specific match wins.
    #[serde(default)]
    pub table_mapping: HashMap<String, String>,
    /// Whether `Truncate` changes may be applied. When false they are
    /// reported as a schema mismatch and dead-letter.
    #[serde(default = "default_true")]
    pub allow_truncate: bool,
}

fn default_true() -> bool {
    true
}

/// Writer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Created,
    Connecting,
    Ready,
    Draining,
    Stopped,
}

/// Point-in-time health of a sink writer.
#[derive(Debug, Clone)]
pub struct SinkHealth {
    pub state: SinkState,
    pub connected: bool,
    pub last_write_time: Option<DateTime<Utc>>,
}

/// The outcome of writing one change.
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub success: bool,
    pub op: ChangeOp,
    /// Key columns of the affected row, when the op has one.
    pub key: Option<Row>,
    pub error_kind: Option<WriteErrorKind>,
    pub error_detail: Option<String>,
    pub duration: Duration,
    /// Rows or documents the store reported as affected.
    pub rows_affected: u64,
    /// Store-assigned identity of the written row/document, if reported.
    pub target_side_id: Option<String>,
}

impl WriteResult {
    pub fn ok(op: ChangeOp, key: Option<Row>, rows_affected: u64, duration: Duration) -> Self {
        WriteResult {
            success: true,
            op,
            key,
            error_kind: None,
            error_detail: None,
            duration,
            rows_affected,
            target_side_id: None,
        }
    }

    pub fn failed(
        op: ChangeOp,
        key: Option<Row>,
        kind: WriteErrorKind,
        detail: impl Into<String>,
        duration: Duration,
    ) -> Self {
        WriteResult {
            success: false,
            op,
            key,
            error_kind: Some(kind),
            error_detail: Some(detail.into()),
            duration,
            rows_affected: 0,
            target_side_id: None,
        }
    }

    pub fn with_target_id(mut self, id: impl Into<String>) -> Self {
        self.target_side_id = Some(id.into());
        self
    }
}

/// One queued change together with its delivery mode.
///
/// `upsert` is false for first deliveries (plain insert fast path) and true
/// once the retry controller has escalated the record.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub change: Arc<Change>,
    pub upsert: bool,
}

/// The shared write contract all sink variants implement.
///
/// `apply`/`apply_batch` report failures inside the returned
/// [`WriteResult`]s rather than as `Err`: a failed row is routine and flows
/// to the retry controller, while `Err` from `connect`/`disconnect` means
/// the component itself is unusable.
#[async_trait]
pub trait SinkWriter: Send {
    /// The name this sink was registered under.
    fn name(&self) -> &str;

    /// Acquire the server-side connection. Idempotent.
    async fn connect(&mut self) -> RiffleResult<()>;

    /// Release the connection. The server-side state is left intact.
    async fn disconnect(&mut self) -> RiffleResult<()>;

    fn health(&self) -> SinkHealth;

    /// Shared live counters for this sink.
    fn stats(&self) -> Arc<SinkStats>;

    /// Write one change.
    async fn apply(&mut self, change: &Change, upsert: bool) -> WriteResult;

    /// Write a batch using the store's native batching. Returns one result
    /// per item, in order. An empty batch returns an empty vec and performs
    /// no I/O.
    async fn apply_batch(&mut self, batch: &[BatchItem]) -> Vec<WriteResult>;

    /// Delete by key without a full `Delete` envelope. Escape hatch; not
    /// used on the main path.
    async fn delete(&mut self, table: &str, key: &Row) -> WriteResult;
}

/// Build a sink writer from configuration. The caller owns connecting it.
pub fn build_sink(
    name: &str,
    config: &SinkConfig,
    stats: Arc<SinkStats>,
) -> RiffleResult<Box<dyn SinkWriter>> {
    match config.kind {
        SinkKind::Relational => Ok(Box::new(RelationalSink::new(name, config.clone(), stats))),
        SinkKind::Document => {
            if config.database.is_none() {
                return Err(RiffleError::InvalidConfiguration(format!(
                    "document sink {name} requires a database"
                )));
            }
            Ok(Box::new(DocumentSink::new(name, config.clone(), stats)))
        }
    }
}
