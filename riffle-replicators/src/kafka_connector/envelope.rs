//! Parsing of CDC envelopes off a broker topic.
//!
//! The wire format is a JSON document with `op` ("c"/"u"/"d"/"r"), `ts_ms`,
//! a `source` block naming the origin table, and optional `before`/`after`
//! row images. An outer `{"payload": {...}}` wrapper (connect-style
//! envelopes) is tolerated. Unknown fields are preserved in the change's
//! headers rather than dropped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use riffle_data::{Change, ChangeMeta, ChangeOp, Row, TableIdent, Value, META_KEY_COLUMNS};
use riffle_errors::{invalid_change_err, RiffleError, RiffleResult};
use riffle_position::Position;
use serde::Deserialize;
use serde_json::Value as Json;

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(default)]
    db: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    table: String,
    #[serde(default, rename = "txId")]
    tx_id: Option<Json>,
    #[serde(flatten)]
    extra: BTreeMap<String, Json>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    op: String,
    #[serde(default)]
    ts_ms: Option<i64>,
    source: RawSource,
    #[serde(default)]
    before: Option<BTreeMap<String, Json>>,
    #[serde(default)]
    after: Option<BTreeMap<String, Json>>,
    #[serde(flatten)]
    extra: BTreeMap<String, Json>,
}

fn image_to_row(image: BTreeMap<String, Json>) -> Row {
    image
        .into_iter()
        .map(|(col, v)| (col, Value::from_json(v)))
        .collect()
}

fn header_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse one envelope into a change at the given position.
///
/// `key_columns` come from the subscription configuration (the record key
/// schema is not self-describing); when empty the change falls back to the
/// standard key policy.
pub(crate) fn parse_envelope(
    payload: &[u8],
    position: Position,
    key_columns: &[String],
) -> RiffleResult<Change> {
    let mut doc: Json = serde_json::from_slice(payload)
        .map_err(|e| invalid_change_err!("undecodable envelope: {e}"))?;

    // Connect-style wrapper: the envelope proper nests under `payload`.
    if let Json::Object(ref mut map) = doc {
        if let Some(inner @ Json::Object(_)) = map.remove("payload") {
            doc = inner;
        }
    }

    let envelope: RawEnvelope = serde_json::from_value(doc)
        .map_err(|e| invalid_change_err!("malformed envelope: {e}"))?;

    let op = match envelope.op.as_str() {
        "c" => ChangeOp::Insert,
        // Snapshot reads replay existing rows; downstream they are inserts.
        "r" => ChangeOp::Insert,
        "u" => ChangeOp::Update,
        "d" => ChangeOp::Delete,
        _ => ChangeOp::Unknown,
    };

    let commit_time = envelope
        .ts_ms
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let mut meta = ChangeMeta {
        commit_time,
        txn_id: envelope.source.tx_id.as_ref().map(header_string),
        ..Default::default()
    };
    if envelope.op == "r" {
        meta.source_meta
            .insert("snapshot".to_owned(), "true".to_owned());
    }
    if !key_columns.is_empty() {
        meta.source_meta
            .insert(META_KEY_COLUMNS.to_owned(), key_columns.join(","));
    }
    for (k, v) in &envelope.extra {
        meta.headers.insert(k.clone(), header_string(v));
    }
    for (k, v) in &envelope.source.extra {
        meta.headers
            .insert(format!("source.{k}"), header_string(v));
    }

    let ident = TableIdent::new(
        envelope.source.db.unwrap_or_default(),
        envelope.source.schema.unwrap_or_default(),
        envelope.source.table,
    );

    let before = envelope.before.map(image_to_row);
    let after = envelope.after.map(image_to_row);
    // Deletes may arrive with both images; only `before` is meaningful.
    let (before, after) = match op {
        ChangeOp::Delete => (before, None),
        ChangeOp::Insert => (None, after),
        _ => (before, after),
    };

    Change::new(op, ident, before, after, meta, position)
}

/// Column names of a JSON-object record key, used to declare the key
/// columns of the change.
pub(crate) fn key_columns_of(key: Option<&[u8]>) -> Vec<String> {
    let Some(key) = key else {
        return Vec::new();
    };
    match serde_json::from_slice::<Json>(key) {
        Ok(Json::Object(mut map)) => {
            // Connect-style keys nest under `payload` too.
            if let Some(Json::Object(inner)) = map.remove("payload") {
                return inner.keys().cloned().collect();
            }
            map.keys().cloned().collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn pos() -> Position {
        Position::from_bytes(vec![0; 12])
    }

    #[test]
    fn parses_create_envelope() {
        let payload = br#"{
            "op": "c",
            "ts_ms": 1714550400000,
            "source": {"db": "app", "schema": "public", "table": "orders", "txId": 581, "lsn": 123},
            "after": {"id": 7, "amount": 100}
        }"#;
        let change = parse_envelope(payload, pos(), &[]).unwrap();
        assert_eq!(change.op(), ChangeOp::Insert);
        assert_eq!(change.table(), "orders");
        assert_eq!(change.after().unwrap()["id"], Value::Int(7));
        assert_eq!(change.txn_id(), Some("581"));
        assert_eq!(change.headers()["source.lsn"], "123");
    }

    #[test]
    fn tolerates_payload_wrapper() {
        let payload = br#"{"payload": {
            "op": "d",
            "ts_ms": 1714550400000,
            "source": {"db": "app", "schema": "public", "table": "orders"},
            "before": {"id": 42}
        }}"#;
        let change = parse_envelope(payload, pos(), &[]).unwrap();
        assert_eq!(change.op(), ChangeOp::Delete);
        assert_eq!(change.before().unwrap()["id"], Value::Int(42));
        assert!(change.after().is_none());
    }

    #[test]
    fn unknown_fields_land_in_headers() {
        let payload = br#"{
            "op": "u",
            "source": {"db": "app", "schema": "public", "table": "orders"},
            "before": {"id": 9, "amount": 10},
            "after": {"id": 9, "amount": 20},
            "transaction": {"id": "5:81"}
        }"#;
        let change = parse_envelope(payload, pos(), &[]).unwrap();
        assert!(change.headers().contains_key("transaction"));
    }

    #[test]
    fn snapshot_reads_become_inserts() {
        let payload = br#"{
            "op": "r",
            "source": {"db": "app", "schema": "public", "table": "orders"},
            "after": {"id": 1}
        }"#;
        let change = parse_envelope(payload, pos(), &[]).unwrap();
        assert_eq!(change.op(), ChangeOp::Insert);
        assert_eq!(change.source_meta()["snapshot"], "true");
    }

    #[test]
    fn configured_key_columns_are_declared() {
        let payload = br#"{
            "op": "c",
            "source": {"db": "app", "schema": "public", "table": "orders"},
            "after": {"region": "eu", "seq": 1, "v": 2}
        }"#;
        let change =
            parse_envelope(payload, pos(), &["region".to_owned(), "seq".to_owned()]).unwrap();
        assert_eq!(change.source_meta()[META_KEY_COLUMNS], "region,seq");
    }

    #[test]
    fn garbage_is_invalid_change() {
        let err = parse_envelope(b"not json", pos(), &[]).unwrap_err();
        assert!(matches!(err, RiffleError::InvalidChange { .. }));
    }

    #[test]
    fn missing_required_image_is_invalid() {
        // An insert without an after image violates the model.
        let payload = br#"{
            "op": "c",
            "source": {"db": "app", "schema": "public", "table": "orders"}
        }"#;
        assert!(matches!(
            parse_envelope(payload, pos(), &[]),
            Err(RiffleError::InvalidChange { .. })
        ));
    }
}
