//! Durable per-source cursors.
//!
//! Connectors whose server keeps the cursor (replication slots, committed
//! consumer offsets) pass through the no-op store; the change-stream
//! connector, whose resume token lives client-side, persists through the
//! relational store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use riffle_errors::{RiffleError, RiffleResult};
use riffle_position::Position;
use tokio_postgres::NoTls;
use tracing::{info, warn};

/// Table the relational store keeps cursors in. Columns are stable:
/// `(source_name text primary key, position_bytes bytea, updated_at
/// timestamptz)`.
pub const POSITION_TABLE: &str = "cdc_position";

/// Durable cursor storage keyed by source name.
///
/// Successive commits for one source must be non-decreasing in the source's
/// order; the caller (the ack path) guarantees it, and implementations must
/// make each commit durable before returning.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// The last committed position for a source, if any.
    async fn load(&self, source: &str) -> RiffleResult<Option<Position>>;

    /// Durably record a position for a source.
    async fn commit(&self, source: &str, position: &Position) -> RiffleResult<()>;
}

/// Store for connectors whose cursor lives server-side.
#[derive(Debug, Default)]
pub struct NoopPositionStore;

#[async_trait]
impl PositionStore for NoopPositionStore {
    async fn load(&self, _source: &str) -> RiffleResult<Option<Position>> {
        Ok(None)
    }

    async fn commit(&self, _source: &str, _position: &Position) -> RiffleResult<()> {
        Ok(())
    }
}

/// In-process store for tests and embedded runs.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: Mutex<HashMap<String, Position>>,
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self, source: &str) -> RiffleResult<Option<Position>> {
        Ok(self.positions.lock().get(source).cloned())
    }

    async fn commit(&self, source: &str, position: &Position) -> RiffleResult<()> {
        self.positions
            .lock()
            .insert(source.to_owned(), position.clone());
        Ok(())
    }
}

/// Cursor storage in a Postgres table ([`POSITION_TABLE`]).
pub struct PostgresPositionStore {
    client: tokio_postgres::Client,
}

impl PostgresPositionStore {
    /// Connect to the store. The table is an external precondition; this
    /// does not run DDL.
    pub async fn connect(connection_string: &str) -> RiffleResult<Self> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| RiffleError::ConnectFailed {
                target: "position store".into(),
                detail: e.to_string(),
            })?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(%err, "position store connection closed");
            }
        });
        info!("position store connected");
        Ok(PostgresPositionStore { client })
    }
}

#[async_trait]
impl PositionStore for PostgresPositionStore {
    async fn load(&self, source: &str) -> RiffleResult<Option<Position>> {
        let sql = format!("SELECT position_bytes FROM {POSITION_TABLE} WHERE source_name = $1");
        let row = self
            .client
            .query_opt(sql.as_str(), &[&source])
            .await
            .map_err(|e| RiffleError::Transient(format!("position load: {e}")))?;
        Ok(row.map(|r| Position::from_bytes(r.get::<_, Vec<u8>>(0))))
    }

    async fn commit(&self, source: &str, position: &Position) -> RiffleResult<()> {
        let sql = format!(
            "INSERT INTO {POSITION_TABLE} (source_name, position_bytes, updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (source_name) DO UPDATE \
             SET position_bytes = EXCLUDED.position_bytes, updated_at = now()"
        );
        self.client
            .execute(sql.as_str(), &[&source, &position.as_bytes()])
            .await
            .map_err(|e| RiffleError::Transient(format!("position commit: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryPositionStore::default();
        assert_eq!(store.load("orders").await.unwrap(), None);
        let pos = Position::from_bytes(vec![9, 9]);
        store.commit("orders", &pos).await.unwrap();
        assert_eq!(store.load("orders").await.unwrap(), Some(pos));
    }

    #[tokio::test]
    async fn noop_store_remembers_nothing() {
        let store = NoopPositionStore;
        store
            .commit("orders", &Position::from_bytes(vec![1]))
            .await
            .unwrap();
        assert_eq!(store.load("orders").await.unwrap(), None);
    }
}
