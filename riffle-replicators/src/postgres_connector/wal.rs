//! Binary parsing of the streaming replication protocol and the `pgoutput`
//! logical decoding plugin's message format.
//!
//! Each `CopyData` frame off the replication connection is either an
//! `XLogData` frame wrapping one logical message, or a keepalive. Logical
//! messages describe transactions (`Begin`/`Commit`), relation metadata
//! (`Relation`/`Type`), and row changes (`Insert`/`Update`/`Delete`/
//! `Truncate`).

use bytes::{Buf, Bytes};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use riffle_errors::RiffleError;
use riffle_position::postgres::Lsn;
use thiserror::Error;

/// Microseconds between the Unix epoch and the Postgres epoch (2000-01-01).
pub(crate) const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

#[derive(Debug, Error)]
pub(crate) enum WalError {
    #[error("truncated replication frame")]
    Incomplete,

    #[error("unknown replication frame tag {0:#x}")]
    UnknownFrame(u8),

    #[error("unknown logical message tag {0:#x}")]
    UnknownMessage(u8),

    #[error("non-utf8 identifier in relation mapping")]
    InvalidName,

    #[error("{schema}.{table}: column of type oid {type_oid} failed to parse: {detail}")]
    ValueParse {
        type_oid: u32,
        schema: String,
        table: String,
        detail: String,
    },

    #[error("relation {0} referenced before its mapping was streamed")]
    UnknownRelation(u32),

    #[error("relation and tuple column counts disagree for {schema}.{table}")]
    ColumnCountMismatch { schema: String, table: String },
}

impl From<WalError> for RiffleError {
    fn from(err: WalError) -> Self {
        RiffleError::ReplicationFailed(err.to_string())
    }
}

/// Convert a Postgres-epoch microsecond timestamp to wall clock.
pub(crate) fn pg_timestamp(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::microseconds(micros + PG_EPOCH_OFFSET_MICROS)
}

/// Checked reader over one frame.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Reader { buf }
    }

    fn ensure(&self, n: usize) -> Result<(), WalError> {
        if self.buf.remaining() < n {
            return Err(WalError::Incomplete);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WalError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn i8(&mut self) -> Result<i8, WalError> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    fn i16(&mut self) -> Result<i16, WalError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> Result<i32, WalError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn u32(&mut self) -> Result<u32, WalError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self) -> Result<i64, WalError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    fn u64(&mut self) -> Result<u64, WalError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    fn lsn(&mut self) -> Result<Lsn, WalError> {
        Ok(Lsn(self.u64()?))
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes, WalError> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n))
    }

    /// A NUL-terminated identifier.
    fn cstr(&mut self) -> Result<String, WalError> {
        let nul = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(WalError::Incomplete)?;
        let raw = self.buf.split_to(nul);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| WalError::InvalidName)
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }
}

/// One frame off the replication stream.
#[derive(Debug)]
pub(crate) enum WalData {
    XLogData {
        start: Lsn,
        #[allow(dead_code)]
        end: Lsn,
        record: WalRecord,
    },
    Keepalive {
        end: Lsn,
        reply: u8,
    },
}

impl TryFrom<Bytes> for WalData {
    type Error = WalError;

    fn try_from(buf: Bytes) -> Result<Self, Self::Error> {
        let mut r = Reader::new(buf);
        match r.u8()? {
            b'w' => {
                let start = r.lsn()?;
                let end = r.lsn()?;
                let _send_time = r.i64()?;
                let record = WalRecord::parse(r.rest())?;
                Ok(WalData::XLogData { start, end, record })
            }
            b'k' => {
                let end = r.lsn()?;
                let _send_time = r.i64()?;
                let reply = r.u8()?;
                Ok(WalData::Keepalive { end, reply })
            }
            tag => Err(WalError::UnknownFrame(tag)),
        }
    }
}

/// Column metadata from a `Relation` message.
#[derive(Debug, Clone)]
pub(crate) struct ColumnSpec {
    /// Bit 1 set when the column is part of the replica identity (key).
    pub(crate) flags: i8,
    pub(crate) name: String,
    pub(crate) type_oid: u32,
}

/// Relation metadata streamed ahead of the first change to a table.
#[derive(Debug, Clone)]
pub(crate) struct RelationMapping {
    pub(crate) id: u32,
    pub(crate) schema: String,
    pub(crate) table: String,
    #[allow(dead_code)]
    pub(crate) replica_identity: i8,
    pub(crate) cols: Vec<ColumnSpec>,
}

impl RelationMapping {
    /// Names of the replica-identity columns, in declaration order.
    pub(crate) fn key_columns(&self) -> Vec<String> {
        self.cols
            .iter()
            .filter(|c| c.flags & 1 == 1)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// One entry of a streamed tuple.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TupleEntry {
    Null,
    /// A TOASTed value that did not change; only appears in update records.
    Unchanged,
    Text(Bytes),
}

/// A streamed row image.
#[derive(Debug, Clone)]
pub(crate) struct TupleData {
    pub(crate) cols: Vec<TupleEntry>,
}

impl TupleData {
    fn parse(r: &mut Reader) -> Result<Self, WalError> {
        let n_cols = r.i16()?;
        let mut cols = Vec::with_capacity(n_cols.max(0) as usize);
        for _ in 0..n_cols {
            match r.u8()? {
                b'n' => cols.push(TupleEntry::Null),
                b'u' => cols.push(TupleEntry::Unchanged),
                b't' => {
                    let len = r.i32()?;
                    cols.push(TupleEntry::Text(r.bytes(len.max(0) as usize)?));
                }
                tag => return Err(WalError::UnknownMessage(tag)),
            }
        }
        Ok(TupleData { cols })
    }
}

/// One logical decoding message.
#[derive(Debug)]
pub(crate) enum WalRecord {
    Begin {
        #[allow(dead_code)]
        final_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        #[allow(dead_code)]
        lsn: Lsn,
        end_lsn: Lsn,
    },
    Origin,
    Relation(RelationMapping),
    Type,
    Insert {
        relation_id: u32,
        new_tuple: TupleData,
    },
    Update {
        relation_id: u32,
        key_tuple: Option<TupleData>,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        relation_id: u32,
        key_tuple: Option<TupleData>,
        old_tuple: Option<TupleData>,
    },
    Truncate {
        relation_ids: Vec<u32>,
    },
    Message,
    Unknown(u8),
}

impl WalRecord {
    fn parse(buf: Bytes) -> Result<Self, WalError> {
        let mut r = Reader::new(buf);
        match r.u8()? {
            b'B' => {
                let final_lsn = r.lsn()?;
                let commit_timestamp = pg_timestamp(r.i64()?);
                let xid = r.u32()?;
                Ok(WalRecord::Begin {
                    final_lsn,
                    commit_timestamp,
                    xid,
                })
            }
            b'C' => {
                let _flags = r.i8()?;
                let lsn = r.lsn()?;
                let end_lsn = r.lsn()?;
                let _commit_timestamp = r.i64()?;
                Ok(WalRecord::Commit { lsn, end_lsn })
            }
            b'O' => Ok(WalRecord::Origin),
            b'R' => {
                let id = r.u32()?;
                let schema = r.cstr()?;
                let table = r.cstr()?;
                let replica_identity = r.i8()?;
                let n_cols = r.i16()?;
                let mut cols = Vec::with_capacity(n_cols.max(0) as usize);
                for _ in 0..n_cols {
                    let flags = r.i8()?;
                    let name = r.cstr()?;
                    let type_oid = r.u32()?;
                    let _type_modifier = r.i32()?;
                    cols.push(ColumnSpec {
                        flags,
                        name,
                        type_oid,
                    });
                }
                Ok(WalRecord::Relation(RelationMapping {
                    id,
                    schema,
                    table,
                    replica_identity,
                    cols,
                }))
            }
            b'Y' => Ok(WalRecord::Type),
            b'I' => {
                let relation_id = r.u32()?;
                match r.u8()? {
                    b'N' => Ok(WalRecord::Insert {
                        relation_id,
                        new_tuple: TupleData::parse(&mut r)?,
                    }),
                    tag => Err(WalError::UnknownMessage(tag)),
                }
            }
            b'U' => {
                let relation_id = r.u32()?;
                let mut key_tuple = None;
                let mut old_tuple = None;
                let new_tuple = loop {
                    match r.u8()? {
                        b'K' => key_tuple = Some(TupleData::parse(&mut r)?),
                        b'O' => old_tuple = Some(TupleData::parse(&mut r)?),
                        b'N' => break TupleData::parse(&mut r)?,
                        tag => return Err(WalError::UnknownMessage(tag)),
                    }
                };
                Ok(WalRecord::Update {
                    relation_id,
                    key_tuple,
                    old_tuple,
                    new_tuple,
                })
            }
            b'D' => {
                let relation_id = r.u32()?;
                let (key_tuple, old_tuple) = match r.u8()? {
                    b'K' => (Some(TupleData::parse(&mut r)?), None),
                    b'O' => (None, Some(TupleData::parse(&mut r)?)),
                    tag => return Err(WalError::UnknownMessage(tag)),
                };
                Ok(WalRecord::Delete {
                    relation_id,
                    key_tuple,
                    old_tuple,
                })
            }
            b'T' => {
                let n_relations = r.i32()?;
                let _options = r.i8()?;
                let mut relation_ids = Vec::with_capacity(n_relations.max(0) as usize);
                for _ in 0..n_relations {
                    relation_ids.push(r.u32()?);
                }
                Ok(WalRecord::Truncate { relation_ids })
            }
            b'M' => Ok(WalRecord::Message),
            tag => Ok(WalRecord::Unknown(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use pretty_assertions::assert_eq;

    use super::*;

    fn xlogdata_frame(record: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(8); // start
        buf.put_u64(16); // end
        buf.put_i64(0); // send time
        buf.put_slice(record);
        buf.freeze()
    }

    #[test]
    fn parses_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(42);
        buf.put_i64(0);
        buf.put_u8(1);
        match WalData::try_from(buf.freeze()).unwrap() {
            WalData::Keepalive { end, reply } => {
                assert_eq!(end, Lsn(42));
                assert_eq!(reply, 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn parses_begin_record() {
        let mut rec = BytesMut::new();
        rec.put_u8(b'B');
        rec.put_u64(99); // final lsn
        rec.put_i64(0); // commit timestamp (pg epoch)
        rec.put_u32(581); // xid
        match WalData::try_from(xlogdata_frame(&rec)).unwrap() {
            WalData::XLogData {
                start,
                record: WalRecord::Begin { xid, commit_timestamp, .. },
                ..
            } => {
                assert_eq!(start, Lsn(8));
                assert_eq!(xid, 581);
                assert_eq!(
                    commit_timestamp,
                    "2000-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
                );
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn relation_record() -> Bytes {
        let mut rec = BytesMut::new();
        rec.put_u8(b'R');
        rec.put_u32(7); // relation id
        rec.put_slice(b"public\0");
        rec.put_slice(b"orders\0");
        rec.put_i8(b'd' as i8); // replica identity: default
        rec.put_i16(2); // columns
        rec.put_i8(1); // key column
        rec.put_slice(b"id\0");
        rec.put_u32(20); // int8
        rec.put_i32(-1);
        rec.put_i8(0);
        rec.put_slice(b"amount\0");
        rec.put_u32(20);
        rec.put_i32(-1);
        rec.freeze()
    }

    #[test]
    fn parses_relation_mapping() {
        match WalData::try_from(xlogdata_frame(&relation_record())).unwrap() {
            WalData::XLogData {
                record: WalRecord::Relation(mapping),
                ..
            } => {
                assert_eq!(mapping.id, 7);
                assert_eq!(mapping.schema, "public");
                assert_eq!(mapping.table, "orders");
                assert_eq!(mapping.key_columns(), vec!["id".to_owned()]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn parses_insert_tuple() {
        let mut rec = BytesMut::new();
        rec.put_u8(b'I');
        rec.put_u32(7);
        rec.put_u8(b'N');
        rec.put_i16(2);
        rec.put_u8(b't');
        rec.put_i32(1);
        rec.put_slice(b"7");
        rec.put_u8(b'n');
        match WalData::try_from(xlogdata_frame(&rec)).unwrap() {
            WalData::XLogData {
                record:
                    WalRecord::Insert {
                        relation_id,
                        new_tuple,
                    },
                ..
            } => {
                assert_eq!(relation_id, 7);
                assert_eq!(new_tuple.cols.len(), 2);
                assert_eq!(new_tuple.cols[1], TupleEntry::Null);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn parses_update_with_old_tuple() {
        let mut rec = BytesMut::new();
        rec.put_u8(b'U');
        rec.put_u32(7);
        rec.put_u8(b'O'); // old image first
        rec.put_i16(1);
        rec.put_u8(b't');
        rec.put_i32(2);
        rec.put_slice(b"10");
        rec.put_u8(b'N');
        rec.put_i16(1);
        rec.put_u8(b't');
        rec.put_i32(2);
        rec.put_slice(b"20");
        match WalData::try_from(xlogdata_frame(&rec)).unwrap() {
            WalData::XLogData {
                record:
                    WalRecord::Update {
                        key_tuple,
                        old_tuple,
                        new_tuple,
                        ..
                    },
                ..
            } => {
                assert!(key_tuple.is_none());
                assert!(old_tuple.is_some());
                assert_eq!(
                    new_tuple.cols[0],
                    TupleEntry::Text(Bytes::from_static(b"20"))
                );
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn parses_delete_by_key() {
        let mut rec = BytesMut::new();
        rec.put_u8(b'D');
        rec.put_u32(7);
        rec.put_u8(b'K');
        rec.put_i16(1);
        rec.put_u8(b't');
        rec.put_i32(1);
        rec.put_slice(b"9");
        match WalData::try_from(xlogdata_frame(&rec)).unwrap() {
            WalData::XLogData {
                record:
                    WalRecord::Delete {
                        key_tuple,
                        old_tuple,
                        ..
                    },
                ..
            } => {
                assert!(key_tuple.is_some());
                assert!(old_tuple.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn parses_truncate_relation_list() {
        let mut rec = BytesMut::new();
        rec.put_u8(b'T');
        rec.put_i32(2);
        rec.put_i8(0); // options
        rec.put_u32(7);
        rec.put_u32(8);
        match WalData::try_from(xlogdata_frame(&rec)).unwrap() {
            WalData::XLogData {
                record: WalRecord::Truncate { relation_ids },
                ..
            } => assert_eq!(relation_ids, vec![7, 8]),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(8);
        assert!(matches!(
            WalData::try_from(buf.freeze()),
            Err(WalError::Incomplete)
        ));
    }

    #[test]
    fn unknown_logical_tag_is_preserved() {
        let rec = [b'Z', 0, 0];
        match WalData::try_from(xlogdata_frame(&rec)).unwrap() {
            WalData::XLogData {
                record: WalRecord::Unknown(tag),
                ..
            } => assert_eq!(tag, b'Z'),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
