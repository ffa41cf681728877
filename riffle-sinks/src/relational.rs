//! The relational sink: translates changes into parameterized SQL against a
//! Postgres-dialect store.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use metrics::counter;
use riffle_data::{key_of, Change, ChangeOp, Row, SinkStats, Value};
use riffle_errors::{RiffleError, RiffleResult, WriteErrorKind};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{Format, IsNull, ToSql, Type};
use tokio_postgres::{GenericClient, NoTls};
use tracing::{debug, info, warn};

use crate::sql::{
    delete_sql, insert_sql, resolve_table, truncate_sql, update_sql, upsert_sql, Dialect,
};
use crate::{
    BatchItem, SinkConfig, SinkHealth, SinkState, SinkWriter, WriteResult, CONNECT_TIMEOUT,
    WRITE_TIMEOUT,
};

/// A change value as a SQL parameter.
///
/// Everything is sent in text format: sources deliver most values as text
/// anyway, and letting the server parse text into the actual column type
/// sidesteps binary-encoding mismatches for columns the model has no native
/// variant for (uuid, inet, numeric, ...).
#[derive(Debug)]
struct PgValue<'a>(&'a Value);

impl ToSql for PgValue<'_> {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        let text = match self.0 {
            Value::Null => return Ok(IsNull::Yes),
            Value::Bool(b) => if *b { "t" } else { "f" }.to_owned(),
            Value::Int(i) => i.to_string(),
            Value::UnsignedInt(u) => u.to_string(),
            Value::Double(d) => d.to_string(),
            Value::Numeric(s) | Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("\\x{}", hex::encode(b)),
            Value::TimestampTz(ts) => ts.to_rfc3339(),
            Value::Json(v) => v.to_string(),
        };
        out.extend_from_slice(text.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

/// Map a driver error onto the write-failure taxonomy.
fn classify_pg_error(err: &tokio_postgres::Error) -> (WriteErrorKind, String) {
    let detail = err.to_string();
    let kind = match err.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => WriteErrorKind::Conflict,
        Some(code)
            if *code == SqlState::UNDEFINED_TABLE
                || *code == SqlState::UNDEFINED_COLUMN
                || *code == SqlState::DATATYPE_MISMATCH
                || *code == SqlState::INVALID_TEXT_REPRESENTATION
                || *code == SqlState::NOT_NULL_VIOLATION
                || *code == SqlState::SYNTAX_ERROR =>
        {
            WriteErrorKind::SchemaMismatch
        }
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::LOCK_NOT_AVAILABLE =>
        {
            WriteErrorKind::Transient
        }
        Some(code)
            if *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
                || *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INSUFFICIENT_PRIVILEGE =>
        {
            WriteErrorKind::Fatal
        }
        // Connection-level failures come through without a SQLSTATE.
        _ => WriteErrorKind::Transient,
    };
    (kind, detail)
}

type PlanError = (WriteErrorKind, String);

/// A statement ready to execute, with parameters borrowed from the change.
struct Plan<'a> {
    sql: String,
    params: Vec<PgValue<'a>>,
    /// For `Update`: re-plan as upsert when zero rows are affected.
    escalate_on_zero_rows: bool,
}

fn cols_of(row: &Row) -> Vec<&str> {
    row.keys().map(String::as_str).collect()
}

fn plan_change<'a>(
    config: &SinkConfig,
    change: &'a Change,
    upsert: bool,
) -> Result<Plan<'a>, PlanError> {
    let dialect = config.dialect;
    let table = resolve_table(config, change);
    match change.op() {
        ChangeOp::Insert => {
            let after = change
                .after()
                .ok_or_else(|| (WriteErrorKind::SchemaMismatch, "insert without row".into()))?;
            let cols = cols_of(after);
            let key = key_of(change);
            let sql = if upsert {
                upsert_sql(dialect, &table, &cols, &cols_of(&key))
            } else {
                insert_sql(dialect, &table, &cols)
            };
            Ok(Plan {
                sql,
                params: after.values().map(PgValue).collect(),
                escalate_on_zero_rows: false,
            })
        }
        ChangeOp::Update => {
            let after = change
                .after()
                .ok_or_else(|| (WriteErrorKind::SchemaMismatch, "update without row".into()))?;
            let key = key_of(change);
            let set_cols: Vec<&str> = after
                .keys()
                .map(String::as_str)
                .filter(|c| !key.contains_key(*c))
                .collect();
            if upsert || set_cols.is_empty() {
                // Every column is part of the key, or the retry controller
                // already escalated: write upsert semantics directly.
                let cols = cols_of(after);
                return Ok(Plan {
                    sql: upsert_sql(dialect, &table, &cols, &cols_of(&key)),
                    params: after.values().map(PgValue).collect(),
                    escalate_on_zero_rows: false,
                });
            }
            let mut params: Vec<PgValue<'a>> = set_cols
                .iter()
                .filter_map(|c| after.get(*c).map(PgValue))
                .collect();
            for col in key.keys() {
                // Key values must come from the change itself so parameters
                // stay borrowed from one place.
                let v = change
                    .write_image()
                    .and_then(|img| img.get(col))
                    .ok_or_else(|| {
                        (
                            WriteErrorKind::SchemaMismatch,
                            format!("key column {col} missing from row image"),
                        )
                    })?;
                params.push(PgValue(v));
            }
            Ok(Plan {
                sql: update_sql(dialect, &table, &set_cols, &cols_of(&key)),
                params,
                escalate_on_zero_rows: true,
            })
        }
        ChangeOp::Delete => {
            let key = key_of(change);
            let params = change
                .before()
                .map(|img| {
                    key.keys()
                        .filter_map(|c| img.get(c).map(PgValue))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Ok(Plan {
                sql: delete_sql(dialect, &table, &cols_of(&key)),
                params,
                escalate_on_zero_rows: false,
            })
        }
        ChangeOp::Truncate => {
            if !config.allow_truncate {
                return Err((
                    WriteErrorKind::SchemaMismatch,
                    format!("truncate of {table} not permitted by sink configuration"),
                ));
            }
            Ok(Plan {
                sql: truncate_sql(dialect, &table),
                params: Vec::new(),
                escalate_on_zero_rows: false,
            })
        }
        ChangeOp::Unknown => Err((
            WriteErrorKind::SchemaMismatch,
            "unknown op has no relational translation".into(),
        )),
    }
}

/// Run one change against `client`, escalating zero-row updates to upsert.
async fn execute_change<C: GenericClient>(
    client: &C,
    config: &SinkConfig,
    change: &Change,
    upsert: bool,
) -> Result<u64, PlanError> {
    let plan = plan_change(config, change, upsert)?;
    let rows = execute_plan(client, &plan).await?;
    if rows == 0 && plan.escalate_on_zero_rows {
        debug!(
            table = change.table(),
            "update matched no rows, writing upsert"
        );
        let upsert_plan = plan_change(config, change, true)?;
        return execute_plan(client, &upsert_plan).await;
    }
    Ok(rows)
}

async fn execute_plan<C: GenericClient>(client: &C, plan: &Plan<'_>) -> Result<u64, PlanError> {
    let params: Vec<&(dyn ToSql + Sync)> = plan
        .params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect();
    match tokio::time::timeout(WRITE_TIMEOUT, client.execute(plan.sql.as_str(), &params)).await {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(err)) => Err(classify_pg_error(&err)),
        Err(_) => Err((
            WriteErrorKind::Transient,
            format!("write timed out after {WRITE_TIMEOUT:?}"),
        )),
    }
}

/// Sink writer for Postgres-dialect relational stores.
pub struct RelationalSink {
    name: String,
    config: SinkConfig,
    stats: Arc<SinkStats>,
    state: SinkState,
    client: Option<tokio_postgres::Client>,
    connection_task: Option<JoinHandle<()>>,
}

impl RelationalSink {
    pub fn new(name: &str, config: SinkConfig, stats: Arc<SinkStats>) -> Self {
        RelationalSink {
            name: name.to_owned(),
            config,
            stats,
            state: SinkState::Created,
            client: None,
            connection_task: None,
        }
    }

    fn result_for(&self, change: &Change, outcome: Result<u64, PlanError>, started: Instant) -> WriteResult {
        let duration = started.elapsed();
        let key = match change.op() {
            ChangeOp::Truncate => None,
            _ => Some(key_of(change)),
        };
        let result = match outcome {
            Ok(rows) => WriteResult::ok(change.op(), key, rows, duration),
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

    fn disconnected_result(&self, change: &Change, started: Instant) -> WriteResult {
        self.result_for(
            change,
            Err((WriteErrorKind::Transient, "sink not connected".into())),
            started,
        )
    }
}

#[async_trait]
impl SinkWriter for RelationalSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> RiffleResult<()> {
        if self.client.is_some() {
            return Ok(());
        }
        self.state = SinkState::Connecting;
        let (client, connection) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_postgres::connect(&self.config.connection_string, NoTls),
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
        let sink = self.name.clone();
        self.connection_task = Some(tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(%sink, %err, "sink connection closed");
            }
        }));
        self.client = Some(client);
        self.state = SinkState::Ready;
        self.stats.set_connected(true);
        info!(sink = %self.name, "relational sink connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> RiffleResult<()> {
        self.client = None;
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        self.state = SinkState::Stopped;
        self.stats.set_connected(false);
        info!(sink = %self.name, "relational sink disconnected");
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
        let Some(client) = self.client.as_ref() else {
            return self.disconnected_result(change, started);
        };
        let outcome = execute_change(client, &self.config, change, upsert).await;
        self.result_for(change, outcome, started)
    }

    async fn apply_batch(&mut self, batch: &[BatchItem]) -> Vec<WriteResult> {
        if batch.is_empty() {
            return Vec::new();
        }
        let started = Instant::now();
        if self.client.is_none() {
            return batch
                .iter()
                .map(|item| self.disconnected_result(&item.change, started))
                .collect();
        }

        // First try the whole batch in one transaction. If anything in it
        // fails, fall back to per-row application so each change gets its
        // own classified result and only failed rows are retried. A client
        // that vanished since the check above takes the same fallback,
        // where every row reports a transient failure.
        let batch_ok = match self.client.as_mut() {
            None => false,
            Some(client) => match client.transaction().await {
                Ok(tx) => {
                    let mut ok = true;
                    for item in batch {
                        if execute_change(&tx, &self.config, &item.change, item.upsert)
                            .await
                            .is_err()
                        {
                            ok = false;
                            break;
                        }
                    }
                    ok && tx.commit().await.is_ok()
                }
                Err(err) => {
                    warn!(sink = %self.name, %err, "could not open batch transaction");
                    false
                }
            },
        };

        if batch_ok {
            return batch
                .iter()
                .map(|item| self.result_for(&item.change, Ok(1), started))
                .collect();
        }

        let mut results = Vec::with_capacity(batch.len());
        for item in batch {
            results.push(self.apply(&item.change, item.upsert).await);
        }
        results
    }

    async fn delete(&mut self, table: &str, key: &Row) -> WriteResult {
        let started = Instant::now();
        let Some(client) = self.client.as_ref() else {
            return WriteResult::failed(
                ChangeOp::Delete,
                Some(key.clone()),
                WriteErrorKind::Transient,
                "sink not connected",
                started.elapsed(),
            );
        };
        let cols: Vec<&str> = key.keys().map(String::as_str).collect();
        let plan = Plan {
            sql: delete_sql(self.config.dialect, table, &cols),
            params: key.values().map(PgValue).collect(),
            escalate_on_zero_rows: false,
        };
        let outcome = execute_plan(client, &plan).await;
        let duration = started.elapsed();
        let result = match outcome {
            Ok(rows) => WriteResult::ok(ChangeOp::Delete, Some(key.clone()), rows, duration),
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

    fn change(op: ChangeOp, before: Option<Row>, after: Option<Row>) -> Change {
        Change::new(
            op,
            TableIdent::new("app", "public", "orders"),
            before,
            after,
            ChangeMeta::default(),
            Position::from_bytes(vec![1]),
        )
        .unwrap()
    }

    fn row(cols: &[(&str, Value)]) -> Row {
        cols.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn config() -> SinkConfig {
        SinkConfig {
            kind: crate::SinkKind::Relational,
            connection_string: String::new(),
            database: None,
            dialect: Dialect::Postgres,
            table_mapping: Default::default(),
            allow_truncate: false,
        }
    }

    #[test]
    fn insert_plan_uses_plain_insert_first() {
        let c = change(
            ChangeOp::Insert,
            None,
            Some(row(&[("id", Value::Int(7)), ("amount", Value::Int(100))])),
        );
        let plan = plan_change(&config(), &c, false).unwrap();
        assert_eq!(
            plan.sql,
            "INSERT INTO \"orders\" (\"id\", \"amount\") VALUES ($1, $2)"
        );
        assert_eq!(plan.params.len(), 2);
        assert!(!plan.escalate_on_zero_rows);
    }

    #[test]
    fn retried_insert_plans_upsert() {
        let c = change(
            ChangeOp::Insert,
            None,
            Some(row(&[("id", Value::Int(7)), ("amount", Value::Int(100))])),
        );
        let plan = plan_change(&config(), &c, true).unwrap();
        assert!(plan.sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
    }

    #[test]
    fn update_plan_escalates_on_zero_rows() {
        let c = change(
            ChangeOp::Update,
            None,
            Some(row(&[("id", Value::Int(9)), ("amount", Value::Int(20))])),
        );
        let plan = plan_change(&config(), &c, false).unwrap();
        assert_eq!(
            plan.sql,
            "UPDATE \"orders\" SET \"amount\" = $1 WHERE \"id\" = $2"
        );
        assert!(plan.escalate_on_zero_rows);
    }

    #[test]
    fn truncate_requires_permission() {
        let c = change(ChangeOp::Truncate, None, None);
        let (kind, _) = plan_change(&config(), &c, false).unwrap_err();
        assert_eq!(kind, WriteErrorKind::SchemaMismatch);

        let mut cfg = config();
        cfg.allow_truncate = true;
        let plan = plan_change(&cfg, &c, false).unwrap();
        assert_eq!(plan.sql, "TRUNCATE \"orders\"");
    }

    #[test]
    fn table_mapping_wins_over_derived_name() {
        let mut cfg = config();
        cfg.table_mapping
            .insert("public.orders".into(), "orders_backup".into());
        let c = change(
            ChangeOp::Insert,
            None,
            Some(row(&[("id", Value::Int(1))])),
        );
        let plan = plan_change(&cfg, &c, false).unwrap();
        assert!(plan.sql.starts_with("INSERT INTO \"orders_backup\""));
    }
}
