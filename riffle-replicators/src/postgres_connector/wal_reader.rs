//! Decoding loop over the replication stream: raw frames in, typed WAL
//! events out.

use std::collections::HashMap;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use riffle_data::{Row, Value};
use riffle_errors::{RiffleError, RiffleResult};
use riffle_position::postgres::Lsn;
use tokio_postgres::types::Type as PgType;
use tokio_postgres::CopyBothDuplex;
use tracing::{debug, trace};

use super::wal::{
    RelationMapping, TupleData, TupleEntry, WalData, WalError, WalRecord, PG_EPOCH_OFFSET_MICROS,
};
use crate::table_filter::TableFilter;

/// A decoded, filter-applied WAL event.
#[derive(Debug)]
pub(crate) enum WalEvent {
    /// The server asked for an immediate standby status update.
    WantsKeepaliveResponse { end: Lsn },
    Begin {
        commit_timestamp: chrono::DateTime<Utc>,
        xid: u32,
    },
    Commit {
        end_lsn: Lsn,
    },
    Insert {
        schema: String,
        table: String,
        key_columns: Vec<String>,
        row: Row,
        lsn: Lsn,
    },
    Update {
        schema: String,
        table: String,
        key_columns: Vec<String>,
        old_row: Option<Row>,
        new_row: Row,
        lsn: Lsn,
    },
    Delete {
        schema: String,
        table: String,
        key_columns: Vec<String>,
        row: Row,
        lsn: Lsn,
    },
    Truncate {
        tables: Vec<(String, String)>,
        lsn: Lsn,
    },
}

pub(crate) struct WalReader {
    /// The handle to the log stream itself.
    stream: Pin<Box<CopyBothDuplex<Bytes>>>,
    /// Relation mappings seen so far, keyed by relation id.
    relations: HashMap<u32, RelationMapping>,
    table_filter: TableFilter,
}

impl WalReader {
    pub(crate) fn new(stream: CopyBothDuplex<Bytes>, table_filter: TableFilter) -> Self {
        WalReader {
            stream: Box::pin(stream),
            relations: HashMap::new(),
            table_filter,
        }
    }

    /// Send a standby status update reporting `acked` as written, flushed,
    /// and applied.
    pub(crate) async fn send_status_update(&mut self, acked: Lsn) -> RiffleResult<()> {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(b'r');
        buf.put_u64(acked.0);
        buf.put_u64(acked.0);
        buf.put_u64(acked.0);
        buf.put_i64(Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS);
        buf.put_u8(0); // no reply requested
        self.stream
            .send(buf.freeze())
            .await
            .map_err(|e| RiffleError::Transient(format!("standby status update: {e}")))?;
        trace!(%acked, "sent standby status update");
        Ok(())
    }

    /// The next event the table filter admits.
    pub(crate) async fn next_event(&mut self) -> RiffleResult<WalEvent> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => return Err(super::classify_stream_error(err)),
                None => {
                    return Err(RiffleError::Transient(
                        "replication stream closed by server".into(),
                    ))
                }
            };

            let (lsn, record) = match WalData::try_from(frame)? {
                WalData::Keepalive { end, reply } if reply == 1 => {
                    return Ok(WalEvent::WantsKeepaliveResponse { end });
                }
                WalData::Keepalive { .. } => continue,
                WalData::XLogData { start, record, .. } => (start, record),
            };

            trace!(%lsn, ?record);

            match record {
                WalRecord::Begin {
                    commit_timestamp,
                    xid,
                    ..
                } => {
                    return Ok(WalEvent::Begin {
                        commit_timestamp,
                        xid,
                    })
                }
                WalRecord::Commit { end_lsn, .. } => return Ok(WalEvent::Commit { end_lsn }),
                WalRecord::Relation(mapping) => {
                    self.relations.insert(mapping.id, mapping);
                }
                WalRecord::Insert {
                    relation_id,
                    new_tuple,
                } => {
                    let Some(relation) = self.admitted_relation(relation_id)? else {
                        continue;
                    };
                    let row = tuple_to_row(relation, &new_tuple, None)?;
                    return Ok(WalEvent::Insert {
                        schema: relation.schema.clone(),
                        table: relation.table.clone(),
                        key_columns: relation.key_columns(),
                        row,
                        lsn,
                    });
                }
                WalRecord::Update {
                    relation_id,
                    key_tuple,
                    old_tuple,
                    new_tuple,
                } => {
                    let Some(relation) = self.admitted_relation(relation_id)? else {
                        continue;
                    };
                    let old_row = match (&old_tuple, &key_tuple) {
                        (Some(old), _) => Some(tuple_to_row(relation, old, None)?),
                        (None, Some(key)) => Some(tuple_to_row(relation, key, None)?),
                        (None, None) => None,
                    };
                    // Unchanged TOAST entries are backfilled from the old
                    // image when the source supplies one.
                    let new_row = tuple_to_row(relation, &new_tuple, old_tuple.as_ref())?;
                    return Ok(WalEvent::Update {
                        schema: relation.schema.clone(),
                        table: relation.table.clone(),
                        key_columns: relation.key_columns(),
                        old_row,
                        new_row,
                        lsn,
                    });
                }
                WalRecord::Delete {
                    relation_id,
                    key_tuple,
                    old_tuple,
                } => {
                    let Some(relation) = self.admitted_relation(relation_id)? else {
                        continue;
                    };
                    let tuple = old_tuple
                        .or(key_tuple)
                        .ok_or_else(|| RiffleError::ReplicationFailed(
                            "delete record without key or old tuple".into(),
                        ))?;
                    let row = tuple_to_row(relation, &tuple, None)?;
                    return Ok(WalEvent::Delete {
                        schema: relation.schema.clone(),
                        table: relation.table.clone(),
                        key_columns: relation.key_columns(),
                        row,
                        lsn,
                    });
                }
                WalRecord::Truncate { relation_ids } => {
                    let mut tables = Vec::with_capacity(relation_ids.len());
                    for relation_id in relation_ids {
                        match self.relations.get(&relation_id) {
                            Some(rel)
                                if self
                                    .table_filter
                                    .should_be_processed(&rel.schema, &rel.table) =>
                            {
                                tables.push((rel.schema.clone(), rel.table.clone()))
                            }
                            Some(_) => {}
                            None => {
                                debug!(relation_id, "ignoring truncate of unknown relation")
                            }
                        }
                    }
                    if tables.is_empty() {
                        continue;
                    }
                    return Ok(WalEvent::Truncate { tables, lsn });
                }
                WalRecord::Origin | WalRecord::Type | WalRecord::Message => {}
                WalRecord::Unknown(tag) => {
                    debug!(tag, "ignoring unknown logical message");
                }
            }
        }
    }

    /// The mapping for a relation, or `None` when the table filter rejects
    /// it.
    fn admitted_relation(&self, relation_id: u32) -> RiffleResult<Option<&RelationMapping>> {
        let relation = self
            .relations
            .get(&relation_id)
            .ok_or(WalError::UnknownRelation(relation_id))?;
        if !self
            .table_filter
            .should_be_processed(&relation.schema, &relation.table)
        {
            return Ok(None);
        }
        Ok(Some(relation))
    }
}

/// Convert a streamed tuple into a row of typed values.
///
/// WAL delivers every entry as text; parsing to the model type is keyed off
/// the relation's column type OIDs. Columns with no native variant flow
/// through as text.
fn tuple_to_row(
    relation: &RelationMapping,
    tuple: &TupleData,
    fill_unchanged_from: Option<&TupleData>,
) -> Result<Row, WalError> {
    if tuple.cols.len() != relation.cols.len() {
        return Err(WalError::ColumnCountMismatch {
            schema: relation.schema.clone(),
            table: relation.table.clone(),
        });
    }

    let mut row = Row::with_capacity(tuple.cols.len());
    for (i, (entry, spec)) in tuple.cols.iter().zip(relation.cols.iter()).enumerate() {
        let entry = match entry {
            TupleEntry::Unchanged => match fill_unchanged_from.map(|old| &old.cols[i]) {
                Some(old_entry) => old_entry,
                // No old image to backfill from: the column is omitted
                // rather than invented.
                None => continue,
            },
            entry => entry,
        };
        let value = match entry {
            TupleEntry::Null => Value::Null,
            TupleEntry::Unchanged => continue,
            TupleEntry::Text(text) => parse_wal_text(relation, spec.type_oid, text)?,
        };
        row.insert(spec.name.clone(), value);
    }
    Ok(row)
}

fn parse_wal_text(
    relation: &RelationMapping,
    type_oid: u32,
    text: &Bytes,
) -> Result<Value, WalError> {
    let s = String::from_utf8_lossy(text);
    let parse_err = |detail: String| WalError::ValueParse {
        type_oid,
        schema: relation.schema.clone(),
        table: relation.table.clone(),
        detail,
    };

    let Some(pg_type) = PgType::from_oid(type_oid) else {
        // Custom or unknown type: leave the value as text and let the
        // target coerce it.
        return Ok(Value::Text(s.into_owned()));
    };

    let value = match pg_type {
        PgType::BOOL => match s.as_ref() {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            other => return Err(parse_err(format!("bad bool {other:?}"))),
        },
        PgType::INT2 | PgType::INT4 | PgType::INT8 => {
            Value::Int(s.parse().map_err(|e| parse_err(format!("{e}")))?)
        }
        PgType::OID => Value::UnsignedInt(s.parse().map_err(|e| parse_err(format!("{e}")))?),
        PgType::FLOAT4 | PgType::FLOAT8 => {
            Value::Double(s.parse().map_err(|e| parse_err(format!("{e}")))?)
        }
        PgType::NUMERIC => Value::Numeric(s.into_owned()),
        PgType::JSON | PgType::JSONB => Value::Json(
            serde_json::from_str(s.as_ref()).map_err(|e| parse_err(format!("{e}")))?,
        ),
        PgType::BYTEA => {
            let hex_str = s.strip_prefix("\\x").unwrap_or(s.as_ref());
            Value::Bytes(hex::decode(hex_str).map_err(|e| parse_err(format!("{e}")))?)
        }
        PgType::TIMESTAMP | PgType::TIMESTAMPTZ => parse_pg_timestamp(s.as_ref())
            .unwrap_or_else(|| Value::Text(s.clone().into_owned())),
        // Everything else (text, varchar, uuid, inet, dates, arrays, ...)
        // flows through as text.
        _ => Value::Text(s.into_owned()),
    };
    Ok(value)
}

/// Parse the server's timestamp renderings (`2024-05-01 10:00:00.5+02`,
/// with or without a zone).
fn parse_pg_timestamp(s: &str) -> Option<Value> {
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(ts) = chrono::DateTime::parse_from_str(s, format) {
            return Some(Value::TimestampTz(ts));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Some(Value::TimestampTz(naive.and_utc().fixed_offset()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::wal::ColumnSpec;
    use super::*;

    fn mapping() -> RelationMapping {
        RelationMapping {
            id: 7,
            schema: "public".into(),
            table: "orders".into(),
            replica_identity: b'd' as i8,
            cols: vec![
                ColumnSpec {
                    flags: 1,
                    name: "id".into(),
                    type_oid: 20, // int8
                },
                ColumnSpec {
                    flags: 0,
                    name: "amount".into(),
                    type_oid: 1700, // numeric
                },
                ColumnSpec {
                    flags: 0,
                    name: "note".into(),
                    type_oid: 25, // text
                },
            ],
        }
    }

    fn text(s: &str) -> TupleEntry {
        TupleEntry::Text(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn tuples_become_typed_rows() {
        let tuple = TupleData {
            cols: vec![text("7"), text("12.50"), TupleEntry::Null],
        };
        let row = tuple_to_row(&mapping(), &tuple, None).unwrap();
        assert_eq!(row["id"], Value::Int(7));
        assert_eq!(row["amount"], Value::Numeric("12.50".into()));
        assert_eq!(row["note"], Value::Null);
    }

    #[test]
    fn unchanged_entries_backfill_from_old_image() {
        let old = TupleData {
            cols: vec![text("7"), text("12.50"), text("toasted")],
        };
        let new = TupleData {
            cols: vec![text("7"), text("99.00"), TupleEntry::Unchanged],
        };
        let row = tuple_to_row(&mapping(), &new, Some(&old)).unwrap();
        assert_eq!(row["note"], Value::Text("toasted".into()));
        assert_eq!(row["amount"], Value::Numeric("99.00".into()));
    }

    #[test]
    fn unchanged_without_old_image_omits_the_column() {
        let new = TupleData {
            cols: vec![text("7"), text("99.00"), TupleEntry::Unchanged],
        };
        let row = tuple_to_row(&mapping(), &new, None).unwrap();
        assert!(!row.contains_key("note"));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn column_count_mismatch_is_an_error() {
        let tuple = TupleData {
            cols: vec![text("7")],
        };
        assert!(matches!(
            tuple_to_row(&mapping(), &tuple, None),
            Err(WalError::ColumnCountMismatch { .. })
        ));
    }

    #[test]
    fn bad_int_is_a_value_parse_error() {
        let tuple = TupleData {
            cols: vec![text("seven"), text("1"), text("x")],
        };
        assert!(matches!(
            tuple_to_row(&mapping(), &tuple, None),
            Err(WalError::ValueParse { type_oid: 20, .. })
        ));
    }

    #[test]
    fn timestamps_parse_with_and_without_zone() {
        let Some(Value::TimestampTz(with_zone)) = parse_pg_timestamp("2024-05-01 10:00:00+02")
        else {
            panic!("zoned timestamp did not parse");
        };
        assert_eq!(with_zone.timezone().local_minus_utc(), 2 * 3600);

        assert!(parse_pg_timestamp("2024-05-01 10:00:00.123456").is_some());
        assert!(parse_pg_timestamp("not a time").is_none());
    }
}
