//! Logical-replication source connector for Postgres.
//!
//! On connect it verifies (or creates) the publication and replication
//! slot, then streams `pgoutput` changes over a `START_REPLICATION`
//! copy-both session, answering keepalives and reporting the acked LSN as
//! the flush position. The slot makes the server retain WAL until we
//! confirm it, so a reconnect resumes exactly at the last acked position.

mod wal;
mod wal_reader;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use riffle_data::{Change, ChangeMeta, ChangeOp, SourceStats, TableIdent, META_KEY_COLUMNS};
use riffle_errors::{internal_err, RiffleError, RiffleResult};
use riffle_position::postgres::Lsn;
use riffle_position::Position;
use tokio::task::JoinHandle;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::table_filter::TableFilter;
use crate::{Connector, ConnectorHealth, ConnectorState, ReconnectBackoff, SourceConfig,
    CONNECT_TIMEOUT};
use wal_reader::{WalEvent, WalReader};

/// How often a standby status update is sent when the stream is quiet.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_PUBLICATION: &str = "riffle";
const DEFAULT_SLOT: &str = "riffle";

/// Classify a driver error from the replication stream: missing slots,
/// plugins, and publications are unrecoverable, everything else is worth a
/// reconnect.
pub(crate) fn classify_stream_error(err: tokio_postgres::Error) -> RiffleError {
    match err.code() {
        Some(code)
            if *code == SqlState::UNDEFINED_OBJECT
                || *code == SqlState::UNDEFINED_FILE
                || *code == SqlState::UNDEFINED_FUNCTION
                || *code == SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE =>
        {
            RiffleError::FatalSource(err.to_string())
        }
        _ => RiffleError::Transient(err.to_string()),
    }
}

pub struct PostgresWalConnector {
    name: String,
    config: SourceConfig,
    pg_config: tokio_postgres::Config,
    database: String,
    stats: Arc<SourceStats>,
    state: ConnectorState,
    paused: Arc<AtomicBool>,
    client: Option<tokio_postgres::Client>,
    connection_task: Option<JoinHandle<()>>,
    reader: Option<WalReader>,
    /// Greatest acked LSN; reported to the server as the flush position.
    acked: Lsn,
    /// Commit timestamp and xid of the transaction currently streaming.
    current_txn: Option<(DateTime<Utc>, u32)>,
    /// Truncates fan out to one change per table; extras queue here.
    pending: VecDeque<Change>,
    backoff: ReconnectBackoff,
}

impl PostgresWalConnector {
    pub fn new(name: &str, config: SourceConfig, stats: Arc<SourceStats>) -> RiffleResult<Self> {
        let mut pg_config = tokio_postgres::Config::from_str(&config.connection_string)
            .map_err(|e| RiffleError::InvalidConfiguration(format!(
                "source {name}: bad connection string: {e}"
            )))?;
        pg_config.replication_mode(ReplicationMode::Logical);
        let database = pg_config
            .get_dbname()
            .unwrap_or("postgres")
            .to_owned();
        Ok(PostgresWalConnector {
            name: name.to_owned(),
            config,
            pg_config,
            database,
            stats,
            state: ConnectorState::Created,
            paused: Arc::new(AtomicBool::new(false)),
            client: None,
            connection_task: None,
            reader: None,
            acked: Lsn::ZERO,
            current_txn: None,
            pending: VecDeque::new(),
            backoff: ReconnectBackoff::new(),
        })
    }

    fn publication(&self) -> &str {
        self.config
            .publication_name
            .as_deref()
            .unwrap_or(DEFAULT_PUBLICATION)
    }

    fn slot(&self) -> &str {
        self.config.slot_name.as_deref().unwrap_or(DEFAULT_SLOT)
    }

    async fn setup_publication(&self) -> RiffleResult<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| internal_err!("publication setup before connect"))?;
        let publication = self.publication();
        let exists = client
            .simple_query(&format!(
                "SELECT 1 FROM pg_publication WHERE pubname = '{}'",
                publication.replace('\'', "''")
            ))
            .await
            .map_err(|e| RiffleError::ConnectFailed {
                target: self.name.clone(),
                detail: format!("publication lookup: {e}"),
            })?
            .into_iter()
            .any(|m| matches!(m, tokio_postgres::SimpleQueryMessage::Row(_)));
        if exists {
            return Ok(());
        }

        let create = if self.config.tables.is_empty() {
            format!("CREATE PUBLICATION \"{publication}\" FOR ALL TABLES")
        } else {
            let tables = self
                .config
                .tables
                .iter()
                .map(|t| {
                    // Entries are schema-qualified or bare; bare names fall
                    // into the search path.
                    t.split('.')
                        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
                        .collect::<Vec<_>>()
                        .join(".")
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("CREATE PUBLICATION \"{publication}\" FOR TABLE {tables}")
        };
        client
            .simple_query(&create)
            .await
            .map_err(|e| RiffleError::ConnectFailed {
                target: self.name.clone(),
                detail: format!("create publication: {e}"),
            })?;
        info!(source = %self.name, publication, "created publication");
        Ok(())
    }

    async fn setup_slot(&self) -> RiffleResult<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| internal_err!("slot setup before connect"))?;
        let create = format!(
            "CREATE_REPLICATION_SLOT \"{}\" LOGICAL \"pgoutput\" NOEXPORT_SNAPSHOT",
            self.slot()
        );
        match client.simple_query(&create).await {
            Ok(_) => {
                info!(source = %self.name, slot = self.slot(), "created replication slot");
                Ok(())
            }
            // An existing slot is reused; its confirmed position wins.
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                debug!(source = %self.name, slot = self.slot(), "reusing replication slot");
                Ok(())
            }
            Err(e) => Err(RiffleError::ConnectFailed {
                target: self.name.clone(),
                detail: format!("create slot: {e}"),
            }),
        }
    }

    async fn start_replication(&mut self) -> RiffleResult<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| internal_err!("replication started before connect"))?;
        let query = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL {} (\"proto_version\" '1', \"publication_names\" '{}')",
            self.slot(),
            self.acked,
            self.publication().replace('\'', "''"),
        );
        let duplex = client
            .copy_both_simple::<bytes::Bytes>(&query)
            .await
            .map_err(classify_stream_error)?;
        let filter = TableFilter::new(self.config.tables.iter().map(String::as_str));
        self.reader = Some(WalReader::new(duplex, filter));
        self.state = ConnectorState::Streaming;
        info!(source = %self.name, slot = self.slot(), start = %self.acked, "replication started");
        Ok(())
    }

    async fn teardown(&mut self) {
        self.reader = None;
        self.client = None;
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        self.stats.set_connected(false);
    }

    /// Reconnect after a transient failure. Buffered-but-unacked records
    /// are dropped with the old reader; the server re-streams from the
    /// acked position.
    async fn reconnect(&mut self) -> RiffleResult<()> {
        self.state = ConnectorState::Reconnecting;
        self.pending.clear();
        self.current_txn = None;
        loop {
            self.teardown().await;
            let delay = self.backoff.next_delay();
            warn!(source = %self.name, ?delay, "reconnecting replication stream");
            tokio::time::sleep(delay).await;
            match self.connect().await {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(err @ RiffleError::FatalSource(_)) => return Err(err),
                Err(err) => {
                    warn!(source = %self.name, %err, "reconnect attempt failed");
                }
            }
        }
    }

    fn make_change(
        &self,
        op: ChangeOp,
        schema: String,
        table: String,
        key_columns: Vec<String>,
        before: Option<riffle_data::Row>,
        after: Option<riffle_data::Row>,
        lsn: Lsn,
    ) -> RiffleResult<Change> {
        let (commit_time, xid) = self
            .current_txn
            .map(|(t, x)| (t, Some(x)))
            .unwrap_or_else(|| (Utc::now(), None));
        let mut meta = ChangeMeta {
            commit_time,
            txn_id: xid.map(|x| x.to_string()),
            ..Default::default()
        };
        if !key_columns.is_empty() {
            meta.source_meta
                .insert(META_KEY_COLUMNS.to_owned(), key_columns.join(","));
        }
        Change::new(
            op,
            TableIdent::new(self.database.clone(), schema, table),
            before,
            after,
            meta,
            lsn.to_position(),
        )
    }
}

#[async_trait::async_trait]
impl Connector for PostgresWalConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> RiffleResult<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        self.state = ConnectorState::Connecting;
        let (client, connection) =
            tokio::time::timeout(CONNECT_TIMEOUT, self.pg_config.connect(NoTls))
                .await
                .map_err(|_| RiffleError::ConnectFailed {
                    target: self.name.clone(),
                    detail: format!("timed out after {CONNECT_TIMEOUT:?}"),
                })?
                .map_err(|e| RiffleError::ConnectFailed {
                    target: self.name.clone(),
                    detail: e.to_string(),
                })?;
        let source = self.name.clone();
        self.connection_task = Some(tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(%source, %err, "replication connection closed");
            }
        }));
        self.client = Some(client);
        self.setup_publication().await?;
        self.setup_slot().await?;
        self.start_replication().await?;
        self.stats.set_connected(true);
        Ok(())
    }

    async fn next_change(&mut self) -> RiffleResult<Change> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                self.stats.record_event();
                return Ok(change);
            }

            // Tempo control: while paused we only keep the cursor alive.
            if self.paused.load(Ordering::Relaxed) {
                self.state = ConnectorState::Paused;
                if let Some(reader) = self.reader.as_mut() {
                    reader.send_status_update(self.acked).await?;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            if self.state == ConnectorState::Paused {
                self.state = ConnectorState::Streaming;
            }

            let Some(reader) = self.reader.as_mut() else {
                return Err(RiffleError::Transient("connector not connected".into()));
            };

            let event =
                match tokio::time::timeout(HEARTBEAT_INTERVAL, reader.next_event()).await {
                    // Idle heartbeat, whether or not rows flow.
                    Err(_) => {
                        reader.send_status_update(self.acked).await?;
                        continue;
                    }
                    Ok(Err(err)) => {
                        if err.is_transient() {
                            self.reconnect().await?;
                            continue;
                        }
                        self.state = ConnectorState::Stopped;
                        return Err(err);
                    }
                    Ok(Ok(event)) => event,
                };

            match event {
                WalEvent::WantsKeepaliveResponse { end } => {
                    self.stats
                        .set_lag_estimate(end.0.saturating_sub(self.acked.0));
                    let acked = self.acked;
                    self.reader
                        .as_mut()
                        .ok_or_else(|| internal_err!("keepalive without an active stream"))?
                        .send_status_update(acked)
                        .await?;
                }
                WalEvent::Begin {
                    commit_timestamp,
                    xid,
                } => {
                    self.current_txn = Some((commit_timestamp, xid));
                }
                WalEvent::Commit { .. } => {
                    self.current_txn = None;
                }
                WalEvent::Insert {
                    schema,
                    table,
                    key_columns,
                    row,
                    lsn,
                } => {
                    let change = self.make_change(
                        ChangeOp::Insert,
                        schema,
                        table,
                        key_columns,
                        None,
                        Some(row),
                        lsn,
                    )?;
                    self.stats.record_event();
                    return Ok(change);
                }
                WalEvent::Update {
                    schema,
                    table,
                    key_columns,
                    old_row,
                    new_row,
                    lsn,
                } => {
                    let change = self.make_change(
                        ChangeOp::Update,
                        schema,
                        table,
                        key_columns,
                        old_row,
                        Some(new_row),
                        lsn,
                    )?;
                    self.stats.record_event();
                    return Ok(change);
                }
                WalEvent::Delete {
                    schema,
                    table,
                    key_columns,
                    row,
                    lsn,
                } => {
                    let change = self.make_change(
                        ChangeOp::Delete,
                        schema,
                        table,
                        key_columns,
                        Some(row),
                        None,
                        lsn,
                    )?;
                    self.stats.record_event();
                    return Ok(change);
                }
                WalEvent::Truncate { tables, lsn } => {
                    for (schema, table) in tables {
                        let change = self.make_change(
                            ChangeOp::Truncate,
                            schema,
                            table,
                            Vec::new(),
                            None,
                            None,
                            lsn,
                        )?;
                        self.pending.push_back(change);
                    }
                }
            }
        }
    }

    fn ack(&mut self, position: &Position) -> RiffleResult<()> {
        let lsn = Lsn::from_position(position)?;
        // Monotonic: stale acks are ignored.
        if lsn > self.acked {
            self.acked = lsn;
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    fn health(&self) -> ConnectorHealth {
        let snapshot = self.stats.snapshot();
        ConnectorHealth {
            state: self.state,
            connected: snapshot.connected,
            last_event_time: snapshot.last_event_time,
            lag_estimate: Some(snapshot.lag_estimate),
        }
    }

    fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    async fn disconnect(&mut self) -> RiffleResult<()> {
        self.teardown().await;
        self.state = ConnectorState::Stopped;
        info!(source = %self.name, "replication connector disconnected");
        Ok(())
    }
}
