//! Source connectors: acquire a server-side cursor, stream row changes as
//! normalized [`Change`] records, and recover from transient failure
//! without losing or silently dropping a change.

mod kafka_connector;
mod mongo_connector;
mod position_store;
mod postgres_connector;
mod table_filter;
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use riffle_data::{Change, SourceStats};
use riffle_errors::{RiffleError, RiffleResult};
use riffle_position::Position;
use serde::{Deserialize, Serialize};

pub use kafka_connector::KafkaBrokerConnector;
pub use mongo_connector::MongoChangeStreamConnector;
pub use position_store::{
    MemoryPositionStore, NoopPositionStore, PositionStore, PostgresPositionStore,
    POSITION_TABLE,
};
pub use postgres_connector::PostgresWalConnector;
pub use table_filter::TableFilter;

/// How long a connector may take to acquire its server-side resources.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The backend family of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Logical-replication stream from a relational store.
    Wal,
    /// Consumer of a topic carrying CDC envelopes.
    Broker,
    /// Document-store change feed.
    ChangeStream,
}

/// Envelope codec for broker sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    Json,
}

/// What to do when a source cursor is invalidated server-side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionLostPolicy {
    /// Reopen the stream at the newest available position, accepting the
    /// gap.
    ResumeLatest,
    /// Surface the loss and stop the connector.
    #[default]
    Fatal,
}

/// Static configuration for one source, as handed to the core already
/// parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub connection_string: String,
    /// WAL sources: publication to stream from (created if absent).
    #[serde(default)]
    pub publication_name: Option<String>,
    /// WAL sources: replication slot name; broker sources reuse this as the
    /// consumer group id.
    #[serde(default)]
    pub slot_name: Option<String>,
    /// Optional allow-list of `schema.table` (or bare `table`) names.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Broker sources: topics to subscribe.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub codec: CodecKind,
    /// Logical database name; change-stream sources watch this database.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub position_lost: PositionLostPolicy,
}

/// Connector lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Created,
    Connecting,
    Streaming,
    Paused,
    Reconnecting,
    Stopped,
}

/// Point-in-time health of a source connector.
#[derive(Debug, Clone)]
pub struct ConnectorHealth {
    pub state: ConnectorState,
    pub connected: bool,
    pub last_event_time: Option<DateTime<Utc>>,
    /// Bytes or records behind the source head, connector-specific.
    pub lag_estimate: Option<u64>,
}

/// The shared contract all source connector variants implement.
///
/// Connectors are pull-driven: the owning task calls [`Connector::next_change`]
/// in a loop and hands each record to the router. Transient failures are
/// absorbed inside `next_change` by reconnecting with backoff; only
/// `PositionLost` (per policy) and fatal failures surface as errors.
#[async_trait]
pub trait Connector: Send {
    /// The name this source was registered under.
    fn name(&self) -> &str;

    /// Acquire server-side resources (slot, consumer group, change-stream
    /// cursor). Idempotent.
    async fn connect(&mut self) -> RiffleResult<()>;

    /// Seed the cursor from an externally stored position before the first
    /// `connect`. Connectors whose cursor is server-side ignore this.
    fn seed_position(&mut self, _position: &Position) -> RiffleResult<()> {
        Ok(())
    }

    /// The next change in stream order. Pending indefinitely while the
    /// source is idle; the caller races it against shutdown.
    async fn next_change(&mut self) -> RiffleResult<Change>;

    /// Declare that every record at or before `position` is durably
    /// processed downstream. Non-blocking; acks below the last accepted ack
    /// are ignored.
    fn ack(&mut self, position: &Position) -> RiffleResult<()>;

    /// Halt the stream while keeping the server-side cursor alive.
    fn pause(&mut self);

    /// Resume a paused stream.
    fn resume(&mut self);

    fn health(&self) -> ConnectorHealth;

    /// Shared live counters for this source.
    fn stats(&self) -> Arc<SourceStats>;

    /// Release local resources; the server-side cursor is preserved so a
    /// later connect resumes without a gap.
    async fn disconnect(&mut self) -> RiffleResult<()>;
}

/// Exponential reconnect backoff shared by the connector variants.
#[derive(Debug)]
pub(crate) struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub(crate) const DEFAULT_BASE: Duration = Duration::from_millis(500);
    pub(crate) const DEFAULT_MAX: Duration = Duration::from_secs(30);

    pub(crate) fn new() -> Self {
        ReconnectBackoff {
            base: Self::DEFAULT_BASE,
            max: Self::DEFAULT_MAX,
            attempt: 0,
        }
    }

    /// The delay to sleep before the next reconnect attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(1 << exp).min(self.max)
    }

    /// Call after a successful reconnect.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Build a connector from configuration. The caller owns connecting it.
pub fn build_connector(
    name: &str,
    config: &SourceConfig,
    stats: Arc<SourceStats>,
) -> RiffleResult<Box<dyn Connector>> {
    match config.kind {
        SourceKind::Wal => Ok(Box::new(PostgresWalConnector::new(
            name,
            config.clone(),
            stats,
        )?)),
        SourceKind::Broker => {
            if config.topics.is_empty() {
                return Err(RiffleError::InvalidConfiguration(format!(
                    "broker source {name} requires at least one topic"
                )));
            }
            Ok(Box::new(KafkaBrokerConnector::new(
                name,
                config.clone(),
                stats,
            )))
        }
        SourceKind::ChangeStream => {
            if config.database.is_none() {
                return Err(RiffleError::InvalidConfiguration(format!(
                    "change-stream source {name} requires a database"
                )));
            }
            Ok(Box::new(MongoChangeStreamConnector::new(
                name,
                config.clone(),
                stats,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = ReconnectBackoff::new();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        for _ in 0..20 {
            assert!(b.next_delay() <= ReconnectBackoff::DEFAULT_MAX);
        }
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn factory_rejects_incomplete_configs() {
        let config = SourceConfig {
            kind: SourceKind::Broker,
            connection_string: "localhost:9092".into(),
            publication_name: None,
            slot_name: None,
            tables: vec![],
            topics: vec![],
            codec: CodecKind::Json,
            database: None,
            position_lost: PositionLostPolicy::Fatal,
        };
        assert!(build_connector("orders", &config, Default::default()).is_err());
    }
}
