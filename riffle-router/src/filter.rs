//! The pipeline filter grammar.
//!
//! A filter expression is whitespace-separated clauses of the form
//! `table:<name>`, `op:<op>`, or `schema:<name>`. Repeating a clause key
//! widens that clause to a set; a record matches iff every clause key with
//! at least one entry matches the corresponding field exactly. Unknown
//! clause keys fail parsing, which fails pipeline registration.

use std::collections::HashSet;
use std::str::FromStr;

use riffle_data::{Change, ChangeOp};
use riffle_errors::{RiffleError, RiffleResult};
use serde::{Deserialize, Serialize};

/// A structured, declarative predicate over a change record.
///
/// Filters never read row values; they see only the table identity and op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    tables: HashSet<String>,
    ops: HashSet<ChangeOp>,
    schemas: HashSet<String>,
}

impl FilterSpec {
    /// The always-true filter.
    pub fn match_all() -> Self {
        FilterSpec::default()
    }

    /// Parse a filter expression. Empty input yields the match-all filter.
    pub fn parse(expression: &str) -> RiffleResult<Self> {
        let mut spec = FilterSpec::default();
        for clause in expression.split_whitespace() {
            let (key, value) = clause.split_once(':').ok_or_else(|| {
                RiffleError::InvalidFilter(format!("clause {clause:?} is not key:value"))
            })?;
            if value.is_empty() {
                return Err(RiffleError::InvalidFilter(format!(
                    "clause {clause:?} has an empty value"
                )));
            }
            match key {
                "table" => {
                    spec.tables.insert(value.to_owned());
                }
                "op" => {
                    spec.ops.insert(ChangeOp::from_str(value)?);
                }
                "schema" => {
                    spec.schemas.insert(value.to_owned());
                }
                other => {
                    return Err(RiffleError::InvalidFilter(format!(
                        "unknown clause key {other:?}"
                    )))
                }
            }
        }
        Ok(spec)
    }

    /// Whether the filter accepts this change.
    pub fn matches(&self, change: &Change) -> bool {
        (self.tables.is_empty() || self.tables.contains(change.table()))
            && (self.ops.is_empty() || self.ops.contains(&change.op()))
            && (self.schemas.is_empty() || self.schemas.contains(change.schema()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use riffle_data::{ChangeMeta, Row, TableIdent, Value};
    use riffle_position::Position;

    use super::*;

    fn change(schema: &str, table: &str, op: ChangeOp) -> Change {
        let row: Row = [("id".to_owned(), Value::Int(1))].into_iter().collect();
        let (before, after) = match op {
            ChangeOp::Delete => (Some(row), None),
            _ => (None, Some(row)),
        };
        Change::new(
            op,
            TableIdent::new("app", schema, table),
            before,
            after,
            ChangeMeta::default(),
            Position::from_bytes(vec![1]),
        )
        .unwrap()
    }

    #[test]
    fn empty_expression_matches_everything() {
        let spec = FilterSpec::parse("").unwrap();
        assert!(spec.matches(&change("public", "orders", ChangeOp::Insert)));
        assert_eq!(spec, FilterSpec::match_all());
    }

    #[test]
    fn table_clause_matches_exactly() {
        let spec = FilterSpec::parse("table:order").unwrap();
        // No substring matching: `order` must not admit `orders`.
        assert!(!spec.matches(&change("public", "orders", ChangeOp::Insert)));
        assert!(spec.matches(&change("public", "order", ChangeOp::Insert)));
    }

    #[test]
    fn clauses_combine_conjunctively() {
        let spec = FilterSpec::parse("table:orders op:insert schema:public").unwrap();
        assert!(spec.matches(&change("public", "orders", ChangeOp::Insert)));
        assert!(!spec.matches(&change("public", "orders", ChangeOp::Delete)));
        assert!(!spec.matches(&change("audit", "orders", ChangeOp::Insert)));
    }

    #[test]
    fn repeated_clause_keys_widen_the_set() {
        let spec = FilterSpec::parse("op:insert op:update").unwrap();
        assert!(spec.matches(&change("public", "orders", ChangeOp::Insert)));
        assert!(spec.matches(&change("public", "orders", ChangeOp::Update)));
        assert!(!spec.matches(&change("public", "orders", ChangeOp::Delete)));
    }

    #[test]
    fn unknown_clause_key_fails() {
        assert!(matches!(
            FilterSpec::parse("database:app"),
            Err(RiffleError::InvalidFilter(_))
        ));
        assert!(matches!(
            FilterSpec::parse("table:"),
            Err(RiffleError::InvalidFilter(_))
        ));
        assert!(matches!(
            FilterSpec::parse("orders"),
            Err(RiffleError::InvalidFilter(_))
        ));
    }

    #[test]
    fn unknown_op_value_fails() {
        assert!(FilterSpec::parse("op:upsert").is_err());
    }
}
