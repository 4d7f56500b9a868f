//! Table schema specs.
//!
//! Every object in a chain carries a schema spec: the ordered list of
//! `(ordinal, name, type, is_pk)` column definitions of its logical table.
//! The spec is the unit of schema compatibility (a diff may only be applied
//! to a target with an identical spec) and is part of every object digest.

use serde::{Deserialize, Serialize};

use crate::sql::{join_idents, quote_ident, qualified};

/// One column of a table schema spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// 1-based ordinal position.
    pub ordinal: i32,
    pub name: String,
    /// The column type as reported by `information_schema` (e.g. `integer`,
    /// `character varying`).
    #[serde(rename = "type")]
    pub col_type: String,
    pub is_pk: bool,
}

/// Ordered schema spec for one logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    columns: Vec<ColumnSpec>,
}

impl TableSchema {
    /// Build a spec from column definitions, normalizing to ordinal order.
    pub fn new(mut columns: Vec<ColumnSpec>) -> Self {
        columns.sort_by_key(|c| c.ordinal);
        TableSchema { columns }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// All column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary-key column names in ordinal order.
    pub fn pk_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_pk)
            .map(|c| c.name.clone())
            .collect()
    }

    /// The change key: primary-key columns, or the whole row when the table
    /// has no primary key.
    pub fn change_key_columns(&self) -> Vec<String> {
        let pks = self.pk_columns();
        if pks.is_empty() { self.column_names() } else { pks }
    }

    /// Columns outside the change key, in ordinal order.
    pub fn non_key_columns(&self) -> Vec<String> {
        let key = self.change_key_columns();
        self.columns
            .iter()
            .filter(|c| !key.contains(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// DDL reconstructing the table from this spec.
    ///
    /// `schema` is ignored for temporary tables, which always live in the
    /// session's temp schema.
    pub fn create_table_sql(
        &self,
        schema: &str,
        table: &str,
        unlogged: bool,
        temporary: bool,
    ) -> String {
        let flavour = if temporary {
            "TEMPORARY "
        } else if unlogged {
            "UNLOGGED "
        } else {
            ""
        };
        let target = if temporary {
            quote_ident(table)
        } else {
            qualified(schema, table)
        };

        let mut cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.col_type))
            .collect();
        let pks = self.pk_columns();
        if !pks.is_empty() {
            cols.push(format!("PRIMARY KEY ({})", join_idents(None, &pks)));
        }

        format!("CREATE {flavour}TABLE {target} ({})", cols.join(", "))
    }

    /// Canonical JSON form used in object digests.
    pub fn canonical_json(&self) -> String {
        // Field order is fixed by the struct definition, column order by
        // ordinal; the same spec always serializes to the same bytes.
        serde_json::to_string(self).expect("schema spec serializes")
    }
}

/// Normalize an `information_schema` type name for spec comparison.
///
/// `character` defaults to `character(1)` when replayed through DDL, so it is
/// widened to `character varying` the way the original column data expects.
pub fn normalize_type(col_type: &str) -> String {
    if col_type == "character" {
        "character varying".to_string()
    } else {
        col_type.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableSchema {
        TableSchema::new(vec![
            ColumnSpec {
                ordinal: 2,
                name: "v".into(),
                col_type: "text".into(),
                is_pk: false,
            },
            ColumnSpec {
                ordinal: 1,
                name: "id".into(),
                col_type: "integer".into(),
                is_pk: true,
            },
        ])
    }

    // ── ordering and key derivation ─────────────────────────────────

    #[test]
    fn test_new_sorts_by_ordinal() {
        assert_eq!(sample().column_names(), vec!["id", "v"]);
    }

    #[test]
    fn test_change_key_is_pk_when_present() {
        assert_eq!(sample().change_key_columns(), vec!["id"]);
        assert_eq!(sample().non_key_columns(), vec!["v"]);
    }

    #[test]
    fn test_change_key_is_whole_row_without_pk() {
        let spec = TableSchema::new(vec![
            ColumnSpec {
                ordinal: 1,
                name: "a".into(),
                col_type: "integer".into(),
                is_pk: false,
            },
            ColumnSpec {
                ordinal: 2,
                name: "b".into(),
                col_type: "text".into(),
                is_pk: false,
            },
        ]);
        assert_eq!(spec.change_key_columns(), vec!["a", "b"]);
        assert!(spec.non_key_columns().is_empty());
    }

    // ── DDL generation ──────────────────────────────────────────────

    #[test]
    fn test_create_table_sql_with_pk() {
        let sql = sample().create_table_sql("work", "t", false, false);
        assert_eq!(
            sql,
            "CREATE TABLE \"work\".\"t\" (\"id\" integer, \"v\" text, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_create_table_sql_unlogged() {
        let sql = sample().create_table_sql("work", "t", true, false);
        assert!(sql.starts_with("CREATE UNLOGGED TABLE"));
    }

    #[test]
    fn test_create_table_sql_temporary_ignores_schema() {
        let sql = sample().create_table_sql("work", "t", false, true);
        assert!(sql.starts_with("CREATE TEMPORARY TABLE \"t\" "));
        assert!(!sql.contains("work"));
    }

    #[test]
    fn test_create_table_sql_without_pk_has_no_constraint() {
        let spec = TableSchema::new(vec![ColumnSpec {
            ordinal: 1,
            name: "a".into(),
            col_type: "integer".into(),
            is_pk: false,
        }]);
        let sql = spec.create_table_sql("s", "t", false, false);
        assert!(!sql.contains("PRIMARY KEY"));
    }

    // ── serde / canonical form ──────────────────────────────────────

    #[test]
    fn test_canonical_json_round_trip() {
        let spec = sample();
        let json = spec.canonical_json();
        let back: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_canonical_json_is_stable() {
        assert_eq!(sample().canonical_json(), sample().canonical_json());
        assert!(sample().canonical_json().contains("\"is_pk\":true"));
    }

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_type("character"), "character varying");
        assert_eq!(normalize_type("integer"), "integer");
    }
}
