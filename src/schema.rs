//! Schema identifiers and table metadata.
//!
//! A connection always has a `main` schema; additional database files are
//! mounted under derived names with `ATTACH`. Source schemas for migration
//! are named deterministically from the source database path so that two
//! handles migrating from the same file agree on the name.

/// Table names starting with this prefix belong to the engine.
pub const BUILTIN_TABLE_PREFIX: &str = "sqlite_";

/// Prefix of schema names derived for attached source databases.
pub const SOURCE_SCHEMA_PREFIX: &str = "rowshift_src_";

/// Identifies a schema on a connection: the always-present `main` schema,
/// or a named schema mounted with `ATTACH`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Schema {
    Main,
    Named(String),
}

impl Schema {
    pub fn main() -> Self {
        Schema::Main
    }

    pub fn is_main(&self) -> bool {
        matches!(self, Schema::Main)
    }

    pub fn name(&self) -> &str {
        match self {
            Schema::Main => "main",
            Schema::Named(name) => name,
        }
    }

    /// Whether `self` and `other` refer to the same mounted database.
    /// Names are derived from the source path, so name equality is path
    /// equality.
    pub fn targets_same_schema(&self, other: &Schema) -> bool {
        self == other
    }
}

/// Derive the schema under which a source database is attached. An empty
/// path means the source table lives in the main schema of the same file.
pub fn schema_for_source_database(path: &str) -> Schema {
    if path.is_empty() {
        Schema::Main
    } else {
        let digest = md5::compute(path.as_bytes());
        Schema::Named(format!("{SOURCE_SCHEMA_PREFIX}{digest:x}"))
    }
}

/// Quote an identifier for interpolation into generated SQL.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// One column of a table, as reported by the engine's table metadata.
#[derive(Clone, Debug)]
pub struct ColumnMeta {
    pub name: String,
    pub declared_type: String,
    /// 1-based position within the primary key, 0 if not part of it.
    pub primary_key_ordinal: i64,
}

impl ColumnMeta {
    /// Index of the column that aliases the rowid: the table's single
    /// primary-key column, declared INTEGER.
    pub fn index_of_integer_primary(columns: &[ColumnMeta]) -> Option<usize> {
        let mut primary = None;
        for (index, column) in columns.iter().enumerate() {
            if column.primary_key_ordinal > 0 {
                if primary.is_some() {
                    // Composite key: no rowid alias.
                    return None;
                }
                primary = Some(index);
            }
        }
        primary.filter(|&index| columns[index].declared_type.eq_ignore_ascii_case("integer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, declared_type: &str, pk: i64) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            primary_key_ordinal: pk,
        }
    }

    #[test]
    fn test_schema_for_empty_path_is_main() {
        assert!(schema_for_source_database("").is_main());
    }

    #[test]
    fn test_schema_derivation_is_deterministic() {
        let a = schema_for_source_database("/tmp/source.db");
        let b = schema_for_source_database("/tmp/source.db");
        assert_eq!(a, b);
        assert!(a.name().starts_with(SOURCE_SCHEMA_PREFIX));
    }

    #[test]
    fn test_distinct_paths_get_distinct_schemas() {
        let a = schema_for_source_database("/tmp/a.db");
        let b = schema_for_source_database("/tmp/b.db");
        assert_ne!(a, b);
        assert!(!a.targets_same_schema(&b));
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_integer_primary_detection() {
        let columns = vec![
            column("id", "INTEGER", 1),
            column("name", "TEXT", 0),
        ];
        assert_eq!(ColumnMeta::index_of_integer_primary(&columns), Some(0));
    }

    #[test]
    fn test_text_primary_is_not_rowid_alias() {
        let columns = vec![
            column("id", "TEXT", 1),
            column("name", "TEXT", 0),
        ];
        assert_eq!(ColumnMeta::index_of_integer_primary(&columns), None);
    }

    #[test]
    fn test_composite_primary_is_not_rowid_alias() {
        let columns = vec![
            column("a", "INTEGER", 1),
            column("b", "INTEGER", 2),
        ];
        assert_eq!(ColumnMeta::index_of_integer_primary(&columns), None);
    }

    #[test]
    fn test_no_primary_key() {
        let columns = vec![column("a", "INTEGER", 0)];
        assert_eq!(ColumnMeta::index_of_integer_primary(&columns), None);
    }
}
