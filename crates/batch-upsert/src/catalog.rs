//! Index catalog: a snapshot of one table's unique constraints.
//!
//! Built once per target table (rebuilt if the schema is reloaded) and
//! consulted by the classifier to map a matched constraint name back to the
//! columns that must drive the corrective update.

use crate::error::{Result, UpsertError};
use crate::schema::Table;

#[derive(Debug, Clone)]
struct IndexEntry {
    name: String,
    columns: Vec<String>,
}

/// Snapshot of a table's unique indexes and primary key, keyed by name.
#[derive(Debug, Clone)]
pub struct IndexCatalog {
    unique_indexes: Vec<IndexEntry>,
    primary_key_name: Option<String>,
    primary_key_columns: Vec<String>,
}

impl IndexCatalog {
    /// Build a catalog from table metadata.
    ///
    /// Every column referenced by a unique index or the primary key must
    /// exist in the table's column list; this is validated here, at build
    /// time, so classification never has to.
    pub fn from_table(table: &Table) -> Result<Self> {
        let mut unique_indexes = Vec::new();

        for index in table.indexes.iter().filter(|i| i.is_unique) {
            for column in &index.columns {
                if table.column_index(column).is_none() {
                    return Err(UpsertError::config(format!(
                        "index '{}' on {} references unknown column '{}'",
                        index.name,
                        table.full_name(),
                        column
                    )));
                }
            }
            unique_indexes.push(IndexEntry {
                name: index.name.clone(),
                columns: index.columns.clone(),
            });
        }

        for column in &table.primary_key {
            if table.column_index(column).is_none() {
                return Err(UpsertError::config(format!(
                    "primary key of {} references unknown column '{}'",
                    table.full_name(),
                    column
                )));
            }
        }

        Ok(IndexCatalog {
            unique_indexes,
            primary_key_name: table.primary_key_name.clone(),
            primary_key_columns: table.primary_key.clone(),
        })
    }

    /// Primary key constraint name, if known.
    pub fn primary_key_name(&self) -> Option<&str> {
        self.primary_key_name.as_deref()
    }

    /// Primary key column names.
    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key_columns
    }

    /// Case-insensitive lookup of a unique index's columns.
    pub fn columns_for(&self, index_name: &str) -> Option<&[String]> {
        self.unique_indexes
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(index_name))
            .map(|e| e.columns.as_slice())
    }

    /// Resolve a constraint name matched in an error message to the index
    /// name and its column list.
    ///
    /// When the matched name is the dialect's primary-key marker (or the
    /// catalog's own primary-key constraint name) and no index of that name
    /// exists, falls back to the primary key entry.
    pub fn resolve(&self, matched: &str, primary_key_marker: &str) -> Option<(String, Vec<String>)> {
        if let Some(entry) = self
            .unique_indexes
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(matched))
        {
            return Some((entry.name.clone(), entry.columns.clone()));
        }

        if self.primary_key_columns.is_empty() {
            return None;
        }

        let names_primary_key = matched.eq_ignore_ascii_case(primary_key_marker)
            || self
                .primary_key_name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(matched));

        if names_primary_key {
            let name = self
                .primary_key_name
                .clone()
                .unwrap_or_else(|| primary_key_marker.to_string());
            return Some((name, self.primary_key_columns.clone()));
        }

        None
    }

    /// All columns covered by any unique index or the primary key, in
    /// catalog order, deduplicated case-insensitively.
    pub fn indexed_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let mut push = |col: &String, out: &mut Vec<String>| {
            if !out.iter().any(|c| c.eq_ignore_ascii_case(col)) {
                out.push(col.clone());
            }
        };
        for col in &self.primary_key_columns {
            push(col, &mut columns);
        }
        for entry in &self.unique_indexes {
            for col in &entry.columns {
                push(col, &mut columns);
            }
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Index};

    fn make_table() -> Table {
        let columns = ["id", "email", "username", "bio"]
            .iter()
            .enumerate()
            .map(|(i, name)| Column {
                name: name.to_string(),
                data_type: "varchar".to_string(),
                is_nullable: false,
                ordinal_pos: i as i32 + 1,
            })
            .collect();
        Table {
            schema: "public".to_string(),
            name: "users".to_string(),
            columns,
            primary_key: vec!["id".to_string()],
            primary_key_name: Some("pk_id".to_string()),
            indexes: vec![
                Index {
                    name: "uq_email".to_string(),
                    columns: vec!["email".to_string()],
                    is_unique: true,
                },
                Index {
                    name: "ix_bio".to_string(),
                    columns: vec!["bio".to_string()],
                    is_unique: false,
                },
            ],
        }
    }

    #[test]
    fn test_build_skips_non_unique_indexes() {
        let catalog = IndexCatalog::from_table(&make_table()).expect("builds");
        assert!(catalog.columns_for("uq_email").is_some());
        assert!(catalog.columns_for("ix_bio").is_none());
    }

    #[test]
    fn test_build_rejects_unknown_index_column() {
        let mut table = make_table();
        table.indexes.push(Index {
            name: "uq_ghost".to_string(),
            columns: vec!["ghost".to_string()],
            is_unique: true,
        });
        let err = IndexCatalog::from_table(&table).unwrap_err();
        assert!(matches!(err, UpsertError::Config(_)));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let catalog = IndexCatalog::from_table(&make_table()).expect("builds");
        assert_eq!(
            catalog.columns_for("UQ_EMAIL"),
            Some(&["email".to_string()][..])
        );
    }

    #[test]
    fn test_primary_marker_falls_back_to_pk() {
        let catalog = IndexCatalog::from_table(&make_table()).expect("builds");
        let (name, columns) = catalog.resolve("PRIMARY", "PRIMARY").expect("resolves");
        assert_eq!(name, "pk_id");
        assert_eq!(columns, vec!["id".to_string()]);
    }

    #[test]
    fn test_pk_constraint_name_resolves() {
        let catalog = IndexCatalog::from_table(&make_table()).expect("builds");
        let (name, columns) = catalog.resolve("PK_ID", "PRIMARY").expect("resolves");
        assert_eq!(name, "pk_id");
        assert_eq!(columns, vec!["id".to_string()]);
    }

    #[test]
    fn test_unknown_name_resolves_to_none() {
        let catalog = IndexCatalog::from_table(&make_table()).expect("builds");
        assert!(catalog.resolve("uq_phone", "PRIMARY").is_none());
    }

    #[test]
    fn test_indexed_columns_ordered_and_deduped() {
        let mut table = make_table();
        table.indexes.push(Index {
            name: "uq_id_email".to_string(),
            columns: vec!["ID".to_string(), "email".to_string()],
            is_unique: true,
        });
        let catalog = IndexCatalog::from_table(&table).expect("builds");
        assert_eq!(
            catalog.indexed_columns(),
            vec!["id".to_string(), "email".to_string()]
        );
    }
}
