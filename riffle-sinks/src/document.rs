//! The document sink: replace-by-id writes against a MongoDB database.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use metrics::counter;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Database};
use riffle_data::{key_of, Change, ChangeOp, Row, SinkStats, Value};
use riffle_errors::{RiffleError, RiffleResult, WriteErrorKind};
use tracing::{debug, info};

use crate::{
    BatchItem, SinkConfig, SinkHealth, SinkState, SinkWriter, WriteResult, CONNECT_TIMEOUT,
};

const DUPLICATE_KEY: i32 = 11000;

/// Convert a change value into its BSON representation.
pub(crate) fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::UnsignedInt(u) => Bson::Int64(i64::try_from(*u).unwrap_or(i64::MAX)),
        Value::Double(d) => Bson::Double(*d),
        // Kept as a string: lossless, and queryable the same way on both
        // sides of the pipeline.
        Value::Numeric(s) => Bson::String(s.clone()),
        Value::Text(s) => Bson::String(s.clone()),
        Value::Bytes(b) => Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: b.clone(),
        }),
        Value::TimestampTz(ts) => Bson::DateTime(bson::DateTime::from_chrono(*ts)),
        Value::Json(v) => bson::to_bson(v).unwrap_or_else(|_| Bson::String(v.to_string())),
    }
}

fn row_to_document(row: &Row) -> Document {
    row.iter()
        .map(|(k, v)| (k.clone(), value_to_bson(v)))
        .collect()
}

/// The `_id` of the document a change addresses: a single-column key
/// collapses to the bare value, a composite key becomes a sub-document.
pub(crate) fn document_id(change: &Change) -> Bson {
    let key = key_of(change);
    if key.len() == 1 {
        value_to_bson(&key[0])
    } else {
        Bson::Document(row_to_document(&key))
    }
}

fn classify_mongo_error(err: &mongodb::error::Error) -> (WriteErrorKind, String) {
    let detail = err.to_string();
    let kind = match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY => {
            WriteErrorKind::Conflict
        }
        ErrorKind::InvalidArgument { .. } => WriteErrorKind::SchemaMismatch,
        ErrorKind::Authentication { .. } => WriteErrorKind::Fatal,
        _ => WriteErrorKind::Transient,
    };
    (kind, detail)
}

/// Sink writer for MongoDB collections, keyed by `_id`.
pub struct DocumentSink {
    name: String,
    config: SinkConfig,
    stats: Arc<SinkStats>,
    state: SinkState,
    db: Option<Database>,
}

impl DocumentSink {
    pub fn new(name: &str, config: SinkConfig, stats: Arc<SinkStats>) -> Self {
        DocumentSink {
            name: name.to_owned(),
            config,
            stats,
            state: SinkState::Created,
            db: None,
        }
    }

    fn collection_name(&self, change: &Change) -> String {
        let qualified = format!("{}.{}", change.schema(), change.table());
        self.config
            .table_mapping
            .get(&qualified)
            .or_else(|| self.config.table_mapping.get(change.table()))
            .cloned()
            .unwrap_or_else(|| change.table().to_owned())
    }

    async fn write_change(
        &self,
        change: &Change,
        upsert: bool,
    ) -> Result<(u64, Option<String>), (WriteErrorKind, String)> {
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| (WriteErrorKind::Transient, "sink not connected".to_owned()))?;
        let coll = db.collection::<Document>(&self.collection_name(change));
        match change.op() {
            ChangeOp::Insert => {
                let id = document_id(change);
                let after = change
                    .after()
                    .ok_or_else(|| (WriteErrorKind::SchemaMismatch, "insert without row".to_owned()))?;
                let mut body = row_to_document(after);
                body.insert("_id", id.clone());
                if upsert {
                    let res = coll
                        .replace_one(doc! { "_id": id.clone() }, body)
                        .upsert(true)
                        .await
                        .map_err(|e| classify_mongo_error(&e))?;
                    return Ok((
                        res.modified_count.max(u64::from(res.upserted_id.is_some())),
                        res.upserted_id.map(|v| v.to_string()),
                    ));
                }
                match coll.insert_one(body.clone()).await {
                    Ok(res) => Ok((1, Some(res.inserted_id.to_string()))),
                    Err(err) => match classify_mongo_error(&err) {
                        // Idempotent replay: the document is already there,
                        // replace it in place.
                        (WriteErrorKind::Conflict, _) => {
                            debug!(sink = %self.name, "duplicate key on insert, replacing");
                            coll.replace_one(doc! { "_id": id }, body)
                                .await
                                .map(|res| (res.modified_count, None))
                                .map_err(|e| classify_mongo_error(&e))
                        }
                        classified => Err(classified),
                    },
                }
            }
            ChangeOp::Update => {
                let id = document_id(change);
                let after = change
                    .after()
                    .ok_or_else(|| (WriteErrorKind::SchemaMismatch, "update without row".to_owned()))?;
                let mut body = row_to_document(after);
                body.insert("_id", id.clone());
                let res = coll
                    .replace_one(doc! { "_id": id }, body)
                    // Replay and out-of-order arrival both look like a
                    // missing target document; create-if-missing keeps the
                    // write retry-safe.
                    .upsert(true)
                    .await
                    .map_err(|e| classify_mongo_error(&e))?;
                Ok((
                    res.modified_count.max(u64::from(res.upserted_id.is_some())),
                    res.upserted_id.map(|v| v.to_string()),
                ))
            }
            ChangeOp::Delete => {
                let id = document_id(change);
                let res = coll
                    .delete_one(doc! { "_id": id })
                    .await
                    .map_err(|e| classify_mongo_error(&e))?;
                // Not-found is success with zero rows.
                Ok((res.deleted_count, None))
            }
            ChangeOp::Truncate => {
                let res = coll
                    .delete_many(doc! {})
                    .await
                    .map_err(|e| classify_mongo_error(&e))?;
                Ok((res.deleted_count, None))
            }
            ChangeOp::Unknown => Err((
                WriteErrorKind::SchemaMismatch,
                "unknown op has no document translation".to_owned(),
            )),
        }
    }

    fn result_for(
        &self,
        change: &Change,
        outcome: Result<(u64, Option<String>), (WriteErrorKind, String)>,
        started: Instant,
    ) -> WriteResult {
        let duration = started.elapsed();
        let key = match change.op() {
            ChangeOp::Truncate => None,
            _ => Some(key_of(change)),
        };
        let result = match outcome {
            Ok((rows, target_id)) => {
                let mut r = WriteResult::ok(change.op(), key, rows, duration);
                r.target_side_id = target_id;
                r
            }
            Err((kind, detail)) => WriteResult::failed(change.op(), key, kind, detail, duration),
        };
        self.stats
            .record_write(change.op(), result.success, duration);
        counter!(
            "riffle_sink_writes_total",
            "sink" => self.name.clone(),
            "outcome" => if result.success { "ok" } else { "failed" },
        )
        .increment(1);
        result
    }
}

#[async_trait]
impl SinkWriter for DocumentSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> RiffleResult<()> {
        if self.db.is_some() {
            return Ok(());
        }
        self.state = SinkState::Connecting;
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
        let database = self
            .config
            .database
            .as_deref()
            .ok_or_else(|| RiffleError::InvalidConfiguration(format!(
                "document sink {} requires a database",
                self.name
            )))?;
        self.db = Some(client.database(database));
        self.state = SinkState::Ready;
        self.stats.set_connected(true);
        info!(sink = %self.name, "document sink connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> RiffleResult<()> {
        self.db = None;
        self.state = SinkState::Stopped;
        self.stats.set_connected(false);
        info!(sink = %self.name, "document sink disconnected");
        Ok(())
    }

    fn health(&self) -> SinkHealth {
        SinkHealth {
            state: self.state,
            connected: self.stats.is_connected(),
            last_write_time: self.stats.last_write_time(),
        }
    }

    fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    async fn apply(&mut self, change: &Change, upsert: bool) -> WriteResult {
        let started = Instant::now();
        let outcome = self.write_change(change, upsert).await;
        self.result_for(change, outcome, started)
    }

    async fn apply_batch(&mut self, batch: &[BatchItem]) -> Vec<WriteResult> {
        // Document writes have no cross-document transaction on the main
        // path; apply sequentially and report per row.
        let mut results = Vec::with_capacity(batch.len());
        for item in batch {
            results.push(self.apply(&item.change, item.upsert).await);
        }
        results
    }

    async fn delete(&mut self, table: &str, key: &Row) -> WriteResult {
        let started = Instant::now();
        let outcome = async {
            let db = self
                .db
                .as_ref()
                .ok_or_else(|| (WriteErrorKind::Transient, "sink not connected".to_owned()))?;
            let coll = db.collection::<Document>(table);
            let id = if key.len() == 1 {
                value_to_bson(&key[0])
            } else {
                Bson::Document(row_to_document(key))
            };
            coll.delete_one(doc! { "_id": id })
                .await
                .map(|res| (res.deleted_count, None::<String>))
                .map_err(|e| classify_mongo_error(&e))
        }
        .await;
        let duration = started.elapsed();
        let result = match outcome {
            Ok((rows, _)) => WriteResult::ok(ChangeOp::Delete, Some(key.clone()), rows, duration),
            Err((kind, detail)) => {
                WriteResult::failed(ChangeOp::Delete, Some(key.clone()), kind, detail, duration)
            }
        };
        self.stats
            .record_write(ChangeOp::Delete, result.success, duration);
        result
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use riffle_data::{ChangeMeta, TableIdent};
    use riffle_position::Position;

    use super::*;

    fn row(cols: &[(&str, Value)]) -> Row {
        cols.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn insert(after: Row) -> Change {
        Change::new(
            ChangeOp::Insert,
            TableIdent::new("app", "public", "orders"),
            None,
            Some(after),
            ChangeMeta::default(),
            Position::from_bytes(vec![1]),
        )
        .unwrap()
    }

    #[test]
    fn single_column_key_collapses_to_bare_id() {
        let change = insert(row(&[("id", Value::Int(7)), ("amount", Value::Int(100))]));
        assert_eq!(document_id(&change), Bson::Int64(7));
    }

    #[test]
    fn composite_key_becomes_subdocument() {
        let change = insert(row(&[("a", Value::Int(1)), ("b", Value::Int(2))]));
        let Bson::Document(d) = document_id(&change) else {
            panic!("expected document id");
        };
        assert_eq!(d.get_i64("a").unwrap(), 1);
        assert_eq!(d.get_i64("b").unwrap(), 2);
    }

    #[test]
    fn values_map_to_bson() {
        assert_eq!(value_to_bson(&Value::Null), Bson::Null);
        assert_eq!(value_to_bson(&Value::Int(-3)), Bson::Int64(-3));
        assert_eq!(
            value_to_bson(&Value::Numeric("1.50".into())),
            Bson::String("1.50".into())
        );
        assert_eq!(
            value_to_bson(&Value::Json(serde_json::json!({"a": "x"}))),
            Bson::Document(doc! { "a": "x" })
        );
    }
}
