//! Migration descriptors.
//!
//! A [`MigrationUserInfo`] is the user-facing binding of a destination
//! table to its source; once the destination's columns have been reflected
//! it is interned into a [`MigrationInfo`], which carries the SQL the
//! stepper executes. Infos are immutable; two infos are equal iff their
//! identifying fields are equal.

use std::collections::BTreeSet;

use crate::schema::{quote_identifier, schema_for_source_database, Schema};

/// User-facing migration descriptor: destination table plus the source it
/// drains. An empty source database path means the source table lives in
/// the same database file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationUserInfo {
    table: String,
    source_table: String,
    source_database: String,
}

impl MigrationUserInfo {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            source_table: String::new(),
            source_database: String::new(),
        }
    }

    pub fn set_source(&mut self, source_table: &str, source_database: &str) {
        self.source_table = source_table.to_string();
        self.source_database = source_database.to_string();
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    pub fn source_database(&self) -> &str {
        &self.source_database
    }

    /// The schema the source database is attached under.
    pub fn source_schema(&self) -> Schema {
        schema_for_source_database(&self.source_database)
    }
}

/// Interned migration descriptor. Built from a user info plus the
/// destination's reflected columns; produces the statements that move,
/// delete, and finally drop rows of the source table.
#[derive(Clone, Debug)]
pub struct MigrationInfo {
    table: String,
    source_table: String,
    source_database: String,
    source_schema: Schema,
    columns: Vec<String>,
    has_integer_primary_key: bool,
}

impl MigrationInfo {
    pub fn new(
        user_info: &MigrationUserInfo,
        columns: &BTreeSet<String>,
        has_integer_primary_key: bool,
    ) -> Self {
        Self {
            table: user_info.table().to_string(),
            source_table: user_info.source_table().to_string(),
            source_database: user_info.source_database().to_string(),
            source_schema: user_info.source_schema(),
            columns: columns.iter().cloned().collect(),
            has_integer_primary_key,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    pub fn source_database(&self) -> &str {
        &self.source_database
    }

    pub fn source_schema(&self) -> &Schema {
        &self.source_schema
    }

    fn qualified_source(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(self.source_schema.name()),
            quote_identifier(&self.source_table),
        )
    }

    /// Column list for the move statement. Tables without an integer
    /// primary key carry their rowid explicitly so the engine rowid
    /// survives the move and replays stay conflict-free.
    fn column_list(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.columns.len() + 1);
        if !self.has_integer_primary_key {
            parts.push("rowid".to_string());
        }
        parts.extend(self.columns.iter().map(|column| quote_identifier(column)));
        parts.join(", ")
    }

    /// Statement copying exactly one row (the highest rowid still in the
    /// source) into the destination. Idempotent against unique-constraint
    /// conflicts; zero changes after a successful step means the source is
    /// drained.
    pub fn stmt_migrate_one_row(&self) -> String {
        if self.columns.is_empty() {
            format!(
                "INSERT OR IGNORE INTO main.{} SELECT * FROM {} ORDER BY rowid DESC LIMIT 1",
                quote_identifier(&self.table),
                self.qualified_source(),
            )
        } else {
            let columns = self.column_list();
            format!(
                "INSERT OR IGNORE INTO main.{}({columns}) SELECT {columns} FROM {} \
                 ORDER BY rowid DESC LIMIT 1",
                quote_identifier(&self.table),
                self.qualified_source(),
            )
        }
    }

    /// Statement deleting from the source the row the move statement just
    /// copied.
    pub fn stmt_delete_migrated_one_row(&self) -> String {
        let source = self.qualified_source();
        format!(
            "DELETE FROM {source} WHERE rowid IN \
             (SELECT rowid FROM {source} ORDER BY rowid DESC LIMIT 1)",
        )
    }

    /// Statement removing the drained source table along with its
    /// triggers and indices.
    pub fn stmt_drop_source_table(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualified_source())
    }
}

impl PartialEq for MigrationInfo {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
            && self.source_table == other.source_table
            && self.source_database == other.source_database
            && self.source_schema == other.source_schema
    }
}

impl Eq for MigrationInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_info(table: &str, source_table: &str, source_database: &str) -> MigrationUserInfo {
        let mut info = MigrationUserInfo::new(table);
        info.set_source(source_table, source_database);
        info
    }

    fn columns(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_same_file_source_targets_main_schema() {
        let info = user_info("tracks", "tracks_old", "");
        assert!(info.source_schema().is_main());
    }

    #[test]
    fn test_migrate_statement_with_integer_primary_key() {
        let user = user_info("tracks", "tracks", "/tmp/legacy.db");
        let info = MigrationInfo::new(&user, &columns(&["id", "title"]), true);

        let sql = info.stmt_migrate_one_row();
        assert!(sql.starts_with("INSERT OR IGNORE INTO main.\"tracks\"(\"id\", \"title\")"));
        assert!(sql.ends_with("ORDER BY rowid DESC LIMIT 1"));
        assert!(!sql.contains("rowid,"), "rowid alias already covers the rowid: {sql}");
    }

    #[test]
    fn test_migrate_statement_without_integer_primary_key_carries_rowid() {
        let user = user_info("tags", "tags", "/tmp/legacy.db");
        let info = MigrationInfo::new(&user, &columns(&["name"]), false);

        let sql = info.stmt_migrate_one_row();
        assert!(sql.contains("(rowid, \"name\") SELECT rowid, \"name\" FROM"));
    }

    #[test]
    fn test_delete_statement_targets_highest_rowid() {
        let user = user_info("tracks", "tracks", "/tmp/legacy.db");
        let info = MigrationInfo::new(&user, &columns(&["id"]), true);

        let sql = info.stmt_delete_migrated_one_row();
        assert!(sql.starts_with("DELETE FROM"));
        assert!(sql.contains("ORDER BY rowid DESC LIMIT 1"));
        assert!(sql.contains(info.source_schema().name()));
    }

    #[test]
    fn test_drop_statement() {
        let user = user_info("tracks", "tracks_old", "");
        let info = MigrationInfo::new(&user, &columns(&["id"]), true);
        assert_eq!(
            info.stmt_drop_source_table(),
            "DROP TABLE IF EXISTS \"main\".\"tracks_old\"",
        );
    }

    #[test]
    fn test_equality_ignores_reflected_columns() {
        let user = user_info("tracks", "tracks", "/tmp/legacy.db");
        let a = MigrationInfo::new(&user, &columns(&["id", "title"]), true);
        let b = MigrationInfo::new(&user, &columns(&["id"]), false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_inequality_on_different_sources() {
        let a = MigrationInfo::new(&user_info("tracks", "tracks", "/tmp/a.db"), &columns(&["id"]), true);
        let b = MigrationInfo::new(&user_info("tracks", "tracks", "/tmp/b.db"), &columns(&["id"]), true);
        assert_ne!(a, b);
    }
}
