//! Document-store source connector: a MongoDB change stream.
//!
//! The resume token is a client-side cursor, so this connector is the one
//! variant that relies on an external position store: the supervisor seeds
//! the last committed token before `connect` and commits tokens as the
//! router acks them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::FullDocumentType;
use mongodb::Client;
use riffle_data::{Change, ChangeMeta, ChangeOp, Row, SourceStats, TableIdent, Value,
    META_KEY_COLUMNS};
use riffle_errors::{internal_err, RiffleError, RiffleResult};
use riffle_position::mongo::ResumeToken as PositionToken;
use riffle_position::Position;
use tracing::{debug, info, warn};

use crate::table_filter::TableFilter;
use crate::{
    Connector, ConnectorHealth, ConnectorState, PositionLostPolicy, ReconnectBackoff,
    SourceConfig, CONNECT_TIMEOUT,
};

/// Convert a BSON value into a change value.
fn bson_to_value(bson: &Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Int((*i).into()),
        Bson::Int64(i) => Value::Int(*i),
        Bson::Double(d) => Value::Double(*d),
        Bson::Decimal128(d) => Value::Numeric(d.to_string()),
        Bson::String(s) => Value::Text(s.clone()),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::Binary(b) => Value::Bytes(b.bytes.clone()),
        Bson::DateTime(dt) => Value::TimestampTz(dt.to_chrono().fixed_offset()),
        other => serde_json::to_value(other)
            .map(Value::Json)
            .unwrap_or_else(|_| Value::Text(other.to_string())),
    }
}

fn document_to_row(doc: &Document) -> Row {
    doc.iter().map(|(k, v)| (k.clone(), bson_to_value(v))).collect()
}

/// Serialize a driver resume token into an opaque position.
fn token_to_position(token: &ResumeToken) -> RiffleResult<Position> {
    match bson::to_bson(token) {
        Ok(Bson::Document(doc)) => PositionToken(doc).to_position(),
        Ok(other) => PositionToken(bson::doc! { "_data": other }).to_position(),
        Err(e) => Err(RiffleError::Serialization(format!("resume token: {e}"))),
    }
}

fn position_to_token(position: &Position) -> RiffleResult<ResumeToken> {
    let doc = PositionToken::from_position(position)?.0;
    bson::from_bson(Bson::Document(doc))
        .map_err(|e| RiffleError::PositionLost(format!("resume token decode: {e}")))
}

type EventStream = ChangeStream<ChangeStreamEvent<Document>>;

pub struct MongoChangeStreamConnector {
    name: String,
    config: SourceConfig,
    stats: Arc<SourceStats>,
    state: ConnectorState,
    paused: Arc<AtomicBool>,
    client: Option<Client>,
    stream: Option<EventStream>,
    filter: TableFilter,
    /// Token to resume from on (re)connect.
    resume_token: Option<ResumeToken>,
    /// Tokens of emitted-but-unacked events, oldest first.
    in_flight: VecDeque<(Position, ResumeToken)>,
    backoff: ReconnectBackoff,
}

impl MongoChangeStreamConnector {
    pub fn new(name: &str, config: SourceConfig, stats: Arc<SourceStats>) -> Self {
        let filter = TableFilter::new(config.tables.iter().map(String::as_str));
        MongoChangeStreamConnector {
            name: name.to_owned(),
            config,
            stats,
            state: ConnectorState::Created,
            paused: Arc::new(AtomicBool::new(false)),
            client: None,
            stream: None,
            filter,
            resume_token: None,
            in_flight: VecDeque::new(),
            backoff: ReconnectBackoff::new(),
        }
    }

    async fn open_stream(&mut self, resume_from: Option<ResumeToken>) -> RiffleResult<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| internal_err!("change stream opened before connect"))?;
        let database = self
            .config
            .database
            .as_deref()
            .ok_or_else(|| internal_err!("change-stream source without a database"))?;
        let db = client.database(database);
        let mut watch = db.watch().full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_from {
            watch = watch.resume_after(token);
        }
        let stream = watch.await.map_err(|e| self.classify_open_error(e))?;
        self.stream = Some(stream);
        self.state = ConnectorState::Streaming;
        Ok(())
    }

    fn classify_open_error(&self, err: mongodb::error::Error) -> RiffleError {
        let detail = err.to_string();
        // Server reports an unresumable token as ChangeStreamHistoryLost.
        if detail.contains("ChangeStreamHistoryLost") || detail.contains("resume") {
            RiffleError::PositionLost(detail)
        } else {
            RiffleError::Transient(detail)
        }
    }

    /// Reconnect per the position-lost policy when the token is gone,
    /// otherwise resume at the last acked token.
    async fn reopen(&mut self) -> RiffleResult<()> {
        self.state = ConnectorState::Reconnecting;
        self.in_flight.clear();
        loop {
            self.stream = None;
            let delay = self.backoff.next_delay();
            warn!(source = %self.name, ?delay, "reopening change stream");
            tokio::time::sleep(delay).await;
            match self.open_stream(self.resume_token.clone()).await {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(RiffleError::PositionLost(detail)) => match self.config.position_lost {
                    PositionLostPolicy::ResumeLatest => {
                        warn!(
                            source = %self.name,
                            %detail,
                            "resume token lost, restarting from the stream head"
                        );
                        self.resume_token = None;
                    }
                    PositionLostPolicy::Fatal => {
                        self.state = ConnectorState::Stopped;
                        return Err(RiffleError::PositionLost(detail));
                    }
                },
                Err(err) => warn!(source = %self.name, %err, "reopen attempt failed"),
            }
        }
    }

    fn event_to_change(&self, event: &ChangeStreamEvent<Document>) -> RiffleResult<Option<Change>> {
        let Some(ns) = event.ns.as_ref() else {
            return Ok(None);
        };
        let collection = ns.coll.clone().unwrap_or_default();
        if !self.filter.should_be_processed(&ns.db, &collection) {
            return Ok(None);
        }

        let op = match event.operation_type {
            OperationType::Insert => ChangeOp::Insert,
            OperationType::Update | OperationType::Replace => ChangeOp::Update,
            OperationType::Delete => ChangeOp::Delete,
            OperationType::Drop => ChangeOp::Truncate,
            _ => return Ok(None),
        };

        let key_row = event.document_key.as_ref().map(document_to_row);
        let key_columns: Vec<String> =
            key_row.as_ref().map(|r| r.keys().cloned().collect()).unwrap_or_default();

        let after = match op {
            ChangeOp::Insert | ChangeOp::Update => match event.full_document.as_ref() {
                Some(doc) => Some(document_to_row(doc)),
                // The post-image can be gone by lookup time; degrade to the
                // changed fields over the key.
                None => {
                    let mut row = key_row.clone().unwrap_or_default();
                    if let Some(desc) = event.update_description.as_ref() {
                        for (k, v) in desc.updated_fields.iter() {
                            row.insert(k.clone(), bson_to_value(v));
                        }
                    }
                    if row.is_empty() {
                        return Ok(None);
                    }
                    Some(row)
                }
            },
            _ => None,
        };
        let before = match op {
            ChangeOp::Delete => key_row.clone(),
            _ => None,
        };

        let commit_time = event
            .cluster_time
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.time.into(), 0))
            .unwrap_or_else(Utc::now);
        let mut meta = ChangeMeta {
            commit_time,
            txn_id: None,
            ..Default::default()
        };
        if !key_columns.is_empty() {
            meta.source_meta
                .insert(META_KEY_COLUMNS.to_owned(), key_columns.join(","));
        }

        let position = token_to_position(&event.id)?;
        let change = Change::new(
            op,
            TableIdent::new(ns.db.clone(), String::new(), collection),
            before,
            after,
            meta,
            position,
        )?;
        Ok(Some(change))
    }
}

#[async_trait::async_trait]
impl Connector for MongoChangeStreamConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> RiffleResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.state = ConnectorState::Connecting;
        if self.client.is_none() {
            let client = tokio::time::timeout(
                CONNECT_TIMEOUT,
                Client::with_uri_str(&self.config.connection_string),
            )
            .await
            .map_err(|_| RiffleError::ConnectFailed {
                target: self.name.clone(),
                detail: format!("timed out after {CONNECT_TIMEOUT:?}"),
            })?
            .map_err(|e| RiffleError::ConnectFailed {
                target: self.name.clone(),
                detail: e.to_string(),
            })?;
            self.client = Some(client);
        }
        self.open_stream(self.resume_token.clone()).await?;
        self.stats.set_connected(true);
        info!(source = %self.name, "change stream opened");
        Ok(())
    }

    fn seed_position(&mut self, position: &Position) -> RiffleResult<()> {
        self.resume_token = Some(position_to_token(position)?);
        Ok(())
    }

    async fn next_change(&mut self) -> RiffleResult<Change> {
        loop {
            if self.paused.load(Ordering::Relaxed) {
                // The cursor stays alive server-side; we just stop pulling.
                self.state = ConnectorState::Paused;
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            if self.state == ConnectorState::Paused {
                self.state = ConnectorState::Streaming;
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(RiffleError::Transient("connector not connected".into()));
            };

            let event = match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    warn!(source = %self.name, %err, "change stream error");
                    self.stats.set_connected(false);
                    self.reopen().await?;
                    self.stats.set_connected(true);
                    continue;
                }
                None => {
                    self.stats.set_connected(false);
                    self.reopen().await?;
                    self.stats.set_connected(true);
                    continue;
                }
            };

            if event.operation_type == OperationType::Invalidate {
                debug!(source = %self.name, "change stream invalidated");
                self.resume_token = None;
                match self.config.position_lost {
                    PositionLostPolicy::ResumeLatest => {
                        self.reopen().await?;
                        continue;
                    }
                    PositionLostPolicy::Fatal => {
                        self.state = ConnectorState::Stopped;
                        return Err(RiffleError::PositionLost(
                            "change stream invalidated".into(),
                        ));
                    }
                }
            }

            match self.event_to_change(&event)? {
                Some(change) => {
                    self.in_flight
                        .push_back((change.position().clone(), event.id.clone()));
                    self.stats.record_event();
                    return Ok(change);
                }
                None => continue,
            }
        }
    }

    fn ack(&mut self, position: &Position) -> RiffleResult<()> {
        // Stale or unknown positions (for example after a reopen cleared
        // the in-flight queue) are ignored.
        if !self.in_flight.iter().any(|(p, _)| p == position) {
            return Ok(());
        }
        // Acks arrive in emission order; drop everything up to and
        // including the acked event and keep its token for resume.
        while let Some((pos, token)) = self.in_flight.pop_front() {
            let done = &pos == position;
            self.resume_token = Some(token);
            if done {
                break;
            }
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
            lag_estimate: None,
        }
    }

    fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    async fn disconnect(&mut self) -> RiffleResult<()> {
        self.stream = None;
        self.client = None;
        self.state = ConnectorState::Stopped;
        self.stats.set_connected(false);
        info!(source = %self.name, "change stream connector disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn bson_scalars_map_to_values() {
        assert_eq!(bson_to_value(&Bson::Int32(4)), Value::Int(4));
        assert_eq!(bson_to_value(&Bson::Null), Value::Null);
        assert_eq!(
            bson_to_value(&Bson::String("x".into())),
            Value::Text("x".into())
        );
        let oid = bson::oid::ObjectId::new();
        assert_eq!(bson_to_value(&Bson::ObjectId(oid)), Value::Text(oid.to_hex()));
    }

    #[test]
    fn documents_become_rows_in_field_order() {
        let doc = bson::doc! { "_id": 7_i64, "amount": 100_i32 };
        let row = document_to_row(&doc);
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["_id", "amount"]);
        assert_eq!(row["amount"], Value::Int(100));
    }
}
