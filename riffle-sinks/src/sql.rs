//! SQL text building for the relational sink.
//!
//! Statements are built per change from its row image, with `$n`
//! placeholders and dialect-quoted identifiers. Key columns come from the
//! change's key policy and are excluded from UPDATE set lists.

use itertools::Itertools;
use riffle_data::Change;
use serde::{Deserialize, Serialize};

use crate::SinkConfig;

/// Identifier-quoting dialect of the target store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Postgres,
}

/// Quote an identifier for the dialect, escaping embedded quotes.
pub fn quote_ident(dialect: Dialect, ident: &str) -> String {
    match dialect {
        Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
    }
}

/// Resolve the target table for a change.
///
/// Tries the explicit mapping first (`schema.table`, then bare `table`);
/// with no mapping the change's unqualified table name is written into the
/// sink's default schema.
pub fn resolve_table(config: &SinkConfig, change: &Change) -> String {
    let qualified = format!("{}.{}", change.schema(), change.table());
    if let Some(mapped) = config
        .table_mapping
        .get(&qualified)
        .or_else(|| config.table_mapping.get(change.table()))
    {
        return mapped.clone();
    }
    change.table().to_owned()
}

/// `INSERT INTO t (cols...) VALUES ($1...)`
pub fn insert_sql(dialect: Dialect, table: &str, cols: &[&str]) -> String {
    let col_list = cols.iter().map(|c| quote_ident(dialect, c)).join(", ");
    let placeholders = (1..=cols.len()).map(|n| format!("${n}")).join(", ");
    format!(
        "INSERT INTO {} ({col_list}) VALUES ({placeholders})",
        quote_ident(dialect, table)
    )
}

/// `INSERT ... ON CONFLICT (key) DO UPDATE SET non-key = EXCLUDED.non-key`,
/// degrading to `DO NOTHING` when every column is part of the key.
pub fn upsert_sql(dialect: Dialect, table: &str, cols: &[&str], key_cols: &[&str]) -> String {
    let insert = insert_sql(dialect, table, cols);
    let conflict_target = key_cols.iter().map(|c| quote_ident(dialect, c)).join(", ");
    let set_list = cols
        .iter()
        .filter(|c| !key_cols.contains(c))
        .map(|c| {
            let q = quote_ident(dialect, c);
            format!("{q} = EXCLUDED.{q}")
        })
        .join(", ");
    if set_list.is_empty() {
        format!("{insert} ON CONFLICT ({conflict_target}) DO NOTHING")
    } else {
        format!("{insert} ON CONFLICT ({conflict_target}) DO UPDATE SET {set_list}")
    }
}

/// `UPDATE t SET c = $i ... WHERE k = $j ...`; set columns precede key
/// columns in placeholder order.
pub fn update_sql(dialect: Dialect, table: &str, set_cols: &[&str], key_cols: &[&str]) -> String {
    let mut n = 0;
    let set_list = set_cols
        .iter()
        .map(|c| {
            n += 1;
            format!("{} = ${n}", quote_ident(dialect, c))
        })
        .join(", ");
    let where_list = key_cols
        .iter()
        .map(|c| {
            n += 1;
            format!("{} = ${n}", quote_ident(dialect, c))
        })
        .join(" AND ");
    format!(
        "UPDATE {} SET {set_list} WHERE {where_list}",
        quote_ident(dialect, table)
    )
}

/// `DELETE FROM t WHERE k = $1 ...`
pub fn delete_sql(dialect: Dialect, table: &str, key_cols: &[&str]) -> String {
    let where_list = key_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(dialect, c), i + 1))
        .join(" AND ");
    format!(
        "DELETE FROM {} WHERE {where_list}",
        quote_ident(dialect, table)
    )
}

/// `TRUNCATE t`
pub fn truncate_sql(dialect: Dialect, table: &str) -> String {
    format!("TRUNCATE {}", quote_ident(dialect, table))
}
