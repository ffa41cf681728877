use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use riffle_errors::{invalid_change_err, RiffleResult};
use riffle_position::Position;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

/// Key in [`ChangeMeta::source_meta`] under which a source declares the
/// primary-key column names of the changed table, comma-separated, in key
/// order.
pub const META_KEY_COLUMNS: &str = "key_columns";

/// The kind of row-level change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    Truncate,
    Unknown,
}

impl ChangeOp {
    /// All ops, in stable index order. Index with [`ChangeOp::index`].
    pub const ALL: [ChangeOp; 5] = [
        ChangeOp::Insert,
        ChangeOp::Update,
        ChangeOp::Delete,
        ChangeOp::Truncate,
        ChangeOp::Unknown,
    ];

    /// A dense index for per-op counters.
    pub fn index(self) -> usize {
        match self {
            ChangeOp::Insert => 0,
            ChangeOp::Update => 1,
            ChangeOp::Delete => 2,
            ChangeOp::Truncate => 3,
            ChangeOp::Unknown => 4,
        }
    }

    /// The lowercase name used in filter expressions and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
            ChangeOp::Truncate => "truncate",
            ChangeOp::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeOp {
    type Err = riffle_errors::RiffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(ChangeOp::Insert),
            "update" => Ok(ChangeOp::Update),
            "delete" => Ok(ChangeOp::Delete),
            "truncate" => Ok(ChangeOp::Truncate),
            "unknown" => Ok(ChangeOp::Unknown),
            other => Err(riffle_errors::RiffleError::InvalidFilter(format!(
                "unknown op {other:?}"
            ))),
        }
    }
}

/// Fully qualified identity of the changed table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdent {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl TableIdent {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        TableIdent {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.table)
    }
}

/// A row image: column name to value, in the source's declaration order.
pub type Row = IndexMap<String, crate::Value>;

/// Everything about a change that is not the row images themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeMeta {
    /// Wall clock of the source-side commit.
    pub commit_time: DateTime<Utc>,
    /// Source transaction identifier, if the source exposes one.
    pub txn_id: Option<String>,
    /// Source-specific metadata (key column declarations, snapshot markers).
    pub source_meta: BTreeMap<String, String>,
    /// Transport headers preserved from the wire (unknown envelope fields).
    pub headers: BTreeMap<String, String>,
}

/// A normalized row-level change event.
///
/// Immutable after construction; [`Change::new`] enforces the per-op row
/// image invariants, so holders of a `Change` never need to re-validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    op: ChangeOp,
    ident: TableIdent,
    before: Option<Row>,
    after: Option<Row>,
    meta: ChangeMeta,
    position: Position,
}

impl Change {
    /// Validate and construct a change record.
    ///
    /// Rules enforced:
    /// * `Insert` requires `after` and forbids `before`;
    /// * `Update` requires `after` (with `before` optional);
    /// * `Delete` requires `before` and forbids `after`;
    /// * `Truncate` forbids both images;
    /// * row images, when present, must be non-empty.
    pub fn new(
        op: ChangeOp,
        ident: TableIdent,
        before: Option<Row>,
        after: Option<Row>,
        meta: ChangeMeta,
        position: Position,
    ) -> RiffleResult<Change> {
        let ctx = &ident;
        if before.as_ref().is_some_and(|r| r.is_empty()) {
            return Err(invalid_change_err!("{op} on {ctx}: empty before image"));
        }
        if after.as_ref().is_some_and(|r| r.is_empty()) {
            return Err(invalid_change_err!("{op} on {ctx}: empty after image"));
        }
        match op {
            ChangeOp::Insert => {
                if after.is_none() {
                    return Err(invalid_change_err!("insert on {ctx} without after image"));
                }
                if before.is_some() {
                    return Err(invalid_change_err!("insert on {ctx} with before image"));
                }
            }
            ChangeOp::Update => {
                if after.is_none() {
                    return Err(invalid_change_err!("update on {ctx} without after image"));
                }
            }
            ChangeOp::Delete => {
                if before.is_none() {
                    return Err(invalid_change_err!("delete on {ctx} without before image"));
                }
                if after.is_some() {
                    return Err(invalid_change_err!("delete on {ctx} with after image"));
                }
            }
            ChangeOp::Truncate => {
                if before.is_some() || after.is_some() {
                    return Err(invalid_change_err!("truncate on {ctx} with row image"));
                }
            }
            ChangeOp::Unknown => {}
        }
        Ok(Change {
            op,
            ident,
            before,
            after,
            meta,
            position,
        })
    }

    pub fn op(&self) -> ChangeOp {
        self.op
    }

    pub fn ident(&self) -> &TableIdent {
        &self.ident
    }

    pub fn table(&self) -> &str {
        &self.ident.table
    }

    pub fn schema(&self) -> &str {
        &self.ident.schema
    }

    pub fn database(&self) -> &str {
        &self.ident.database
    }

    pub fn before(&self) -> Option<&Row> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&Row> {
        self.after.as_ref()
    }

    pub fn commit_time(&self) -> DateTime<Utc> {
        self.meta.commit_time
    }

    pub fn txn_id(&self) -> Option<&str> {
        self.meta.txn_id.as_deref()
    }

    pub fn source_meta(&self) -> &BTreeMap<String, String> {
        &self.meta.source_meta
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.meta.headers
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    /// The row image writes are derived from: `after` for inserts/updates,
    /// `before` for deletes.
    pub fn write_image(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// Extract the primary-key columns of a change, in order.
///
/// Resolution policy:
/// 1. if the source declared key columns in `source_meta` under
///    [`META_KEY_COLUMNS`], use those (columns missing from the row image
///    are skipped);
/// 2. else, if the row image has a column named `id` or `Id`, use it;
/// 3. else, the whole row image (`after` for insert/update, `before` for
///    delete).
pub fn key_of(change: &Change) -> Row {
    let Some(image) = change.write_image() else {
        return Row::new();
    };

    if let Some(declared) = change.meta.source_meta.get(META_KEY_COLUMNS) {
        let key: Row = declared
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .filter_map(|c| image.get(c).map(|v| (c.to_owned(), v.clone())))
            .collect();
        if !key.is_empty() {
            return key;
        }
    }

    for candidate in ["id", "Id"] {
        if let Some(v) = image.get(candidate) {
            return Row::from_iter([(candidate.to_owned(), v.clone())]);
        }
    }

    image.clone()
}

/// A stable 128-bit fingerprint of a change, suitable for idempotency
/// checks and dead-letter bookkeeping.
///
/// Hashes `(database, schema, table, op, key columns, position)`; equal
/// logical changes fingerprint equally across processes and restarts.
pub fn fingerprint(change: &Change) -> [u8; 16] {
    let key = key_of(change);
    let key_pairs: Vec<(&str, &crate::Value)> = key.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let input = (
        &change.ident.database,
        &change.ident.schema,
        &change.ident.table,
        change.op.as_str(),
        key_pairs,
        change.position.as_bytes(),
    );
    let encoded = bincode::serialize(&input).expect("in-memory encoding cannot fail");
    xxh3_128(&encoded).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use riffle_errors::RiffleError;

    use super::*;
    use crate::Value;

    fn ident() -> TableIdent {
        TableIdent::new("app", "public", "orders")
    }

    fn row(cols: &[(&str, Value)]) -> Row {
        cols.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn pos(n: u64) -> Position {
        Position::from_bytes(n.to_be_bytes().to_vec())
    }

    #[test]
    fn insert_requires_after_only() {
        let after = row(&[("id", Value::Int(7)), ("amount", Value::Int(100))]);
        assert!(Change::new(
            ChangeOp::Insert,
            ident(),
            None,
            Some(after.clone()),
            ChangeMeta::default(),
            pos(1),
        )
        .is_ok());

        let err = Change::new(
            ChangeOp::Insert,
            ident(),
            Some(after.clone()),
            Some(after.clone()),
            ChangeMeta::default(),
            pos(1),
        )
        .unwrap_err();
        assert!(matches!(err, RiffleError::InvalidChange { .. }));

        assert!(Change::new(
            ChangeOp::Insert,
            ident(),
            None,
            None,
            ChangeMeta::default(),
            pos(1)
        )
        .is_err());
    }

    #[test]
    fn delete_requires_before_only() {
        let before = row(&[("id", Value::Int(42))]);
        assert!(Change::new(
            ChangeOp::Delete,
            ident(),
            Some(before.clone()),
            None,
            ChangeMeta::default(),
            pos(2),
        )
        .is_ok());
        assert!(Change::new(
            ChangeOp::Delete,
            ident(),
            None,
            None,
            ChangeMeta::default(),
            pos(2)
        )
        .is_err());
        assert!(Change::new(
            ChangeOp::Delete,
            ident(),
            Some(before.clone()),
            Some(before),
            ChangeMeta::default(),
            pos(2),
        )
        .is_err());
    }

    #[test]
    fn truncate_carries_no_images() {
        assert!(Change::new(
            ChangeOp::Truncate,
            ident(),
            None,
            None,
            ChangeMeta::default(),
            pos(3)
        )
        .is_ok());
        assert!(Change::new(
            ChangeOp::Truncate,
            ident(),
            None,
            Some(row(&[("id", Value::Int(1))])),
            ChangeMeta::default(),
            pos(3),
        )
        .is_err());
    }

    #[test]
    fn empty_images_are_rejected() {
        assert!(Change::new(
            ChangeOp::Insert,
            ident(),
            None,
            Some(Row::new()),
            ChangeMeta::default(),
            pos(4),
        )
        .is_err());
    }

    #[test]
    fn key_of_prefers_declared_columns() {
        let mut meta = ChangeMeta::default();
        meta.source_meta
            .insert(META_KEY_COLUMNS.into(), "region, id".into());
        let after = row(&[
            ("id", Value::Int(7)),
            ("region", Value::Text("eu".into())),
            ("amount", Value::Int(100)),
        ]);
        let change =
            Change::new(ChangeOp::Insert, ident(), None, Some(after), meta, pos(5)).unwrap();
        let key = key_of(&change);
        assert_eq!(
            key.keys().collect::<Vec<_>>(),
            vec!["region", "id"],
            "declared order is preserved"
        );
    }

    #[test]
    fn key_of_falls_back_to_id_column() {
        let after = row(&[("amount", Value::Int(1)), ("id", Value::Int(9))]);
        let change = Change::new(
            ChangeOp::Insert,
            ident(),
            None,
            Some(after),
            ChangeMeta::default(),
            pos(6),
        )
        .unwrap();
        let key = key_of(&change);
        assert_eq!(key.keys().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn key_of_falls_back_to_whole_image() {
        let before = row(&[("a", Value::Int(1)), ("b", Value::Int(2))]);
        let change = Change::new(
            ChangeOp::Delete,
            ident(),
            Some(before.clone()),
            None,
            ChangeMeta::default(),
            pos(7),
        )
        .unwrap();
        assert_eq!(key_of(&change), before);
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let make = |amount: i64, position: u64| {
            Change::new(
                ChangeOp::Insert,
                ident(),
                None,
                Some(row(&[("id", Value::Int(7)), ("amount", Value::Int(amount))])),
                ChangeMeta::default(),
                pos(position),
            )
            .unwrap()
        };
        // Same key, same position: equal even when non-key columns differ.
        assert_eq!(fingerprint(&make(100, 1)), fingerprint(&make(200, 1)));
        // Different position: different fingerprint.
        assert_ne!(fingerprint(&make(100, 1)), fingerprint(&make(100, 2)));
    }

    #[test]
    fn serde_round_trip_is_identity() {
        let mut meta = ChangeMeta::default();
        meta.txn_id = Some("581".into());
        meta.headers.insert("origin".into(), "wal".into());
        let change = Change::new(
            ChangeOp::Update,
            ident(),
            Some(row(&[("id", Value::Int(9)), ("amount", Value::Int(10))])),
            Some(row(&[("id", Value::Int(9)), ("amount", Value::Int(20))])),
            meta,
            pos(8),
        )
        .unwrap();
        let encoded = serde_json::to_string(&change).unwrap();
        let decoded: Change = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, change);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }
}
