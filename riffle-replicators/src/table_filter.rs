//! Source-level table allow-listing.
//!
//! Applied while decoding the replication stream, before normalization, so
//! tables nobody asked for never reach the router. Entries are
//! `schema.table` or bare `table` (any schema); matching is
//! case-insensitive, the way the upstream folds unquoted identifiers.

use std::collections::HashSet;

/// Allow-list over `(schema, table)` pairs. An empty filter admits every
/// table.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    qualified: HashSet<(String, String)>,
    unqualified: HashSet<String>,
}

impl TableFilter {
    /// Build from configured entries.
    pub fn new<'a>(entries: impl IntoIterator<Item = &'a str>) -> Self {
        let mut filter = TableFilter::default();
        for entry in entries {
            let entry = entry.trim().to_lowercase();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('.') {
                Some((schema, table)) => {
                    filter
                        .qualified
                        .insert((schema.to_owned(), table.to_owned()));
                }
                None => {
                    filter.unqualified.insert(entry);
                }
            }
        }
        filter
    }

    /// Whether changes for this table should be processed.
    pub fn should_be_processed(&self, schema: &str, table: &str) -> bool {
        if self.qualified.is_empty() && self.unqualified.is_empty() {
            return true;
        }
        let schema = schema.to_lowercase();
        let table = table.to_lowercase();
        self.unqualified.contains(&table) || self.qualified.contains(&(schema, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_admits_everything() {
        let f = TableFilter::new([]);
        assert!(f.should_be_processed("public", "orders"));
    }

    #[test]
    fn qualified_entries_match_their_schema_only() {
        let f = TableFilter::new(["public.orders"]);
        assert!(f.should_be_processed("public", "orders"));
        assert!(!f.should_be_processed("audit", "orders"));
        assert!(!f.should_be_processed("public", "users"));
    }

    #[test]
    fn unqualified_entries_match_any_schema() {
        let f = TableFilter::new(["orders"]);
        assert!(f.should_be_processed("public", "orders"));
        assert!(f.should_be_processed("audit", "orders"));
    }

    #[test]
    fn matching_folds_case() {
        let f = TableFilter::new(["Public.Orders"]);
        assert!(f.should_be_processed("PUBLIC", "orders"));
    }

    #[test]
    fn no_substring_matching() {
        let f = TableFilter::new(["order"]);
        assert!(!f.should_be_processed("public", "orders"));
    }
}
