use std::collections::BTreeSet;
use std::path::Path;

use log::info;
use rusqlite::Connection;

use crate::error::RowShiftError;
use crate::schema::{ColumnMeta, Schema};

/// Owning wrapper around one engine connection, exposing the primitives
/// the migration core steps through: execution, transaction scope, and
/// schema-master reflection.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    path: String,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, RowShiftError> {
        info!("Opening database: {}", db_path.display());
        let conn = Connection::open(db_path)?;

        Ok(Self {
            conn,
            path: db_path.to_string_lossy().into_owned(),
        })
    }

    /// A private in-memory database; used by reflection-only callers and
    /// tests that never attach a second file.
    pub fn open_in_memory() -> Result<Self, RowShiftError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            path: String::new(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn execute(&self, sql: &str) -> Result<usize, RowShiftError> {
        Ok(self.conn.execute(sql, [])?)
    }

    /// Execute a statement whose single parameter is a database path
    /// (ATTACH binds its path rather than interpolating it).
    pub fn execute_with_path_param(&self, sql: &str, path: &str) -> Result<usize, RowShiftError> {
        Ok(self.conn.execute(sql, [path])?)
    }

    /// Rows changed by the most recent statement on this connection.
    pub fn changes(&self) -> u64 {
        self.conn.changes()
    }

    pub fn is_in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Run `body` inside a transaction: commit on `Ok`, roll back on `Err`.
    /// The transaction guard is scope-bound, so no path leaks an open
    /// transaction.
    pub fn run_transaction<T, F>(&self, body: F) -> Result<T, RowShiftError>
    where
        F: FnOnce(&Connection) -> Result<T, RowShiftError>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = body(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn table_exists(&self, schema: &Schema, table: &str) -> Result<bool, RowShiftError> {
        let sql = format!(
            "SELECT count(*) FROM {}.sqlite_master WHERE type='table' AND name=?1",
            crate::schema::quote_identifier(schema.name()),
        );
        let count: i64 = self.conn.query_row(&sql, [table], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Column metadata of a table, or an empty list when the table does not
    /// exist.
    pub fn get_table_meta(
        &self,
        schema: &Schema,
        table: &str,
    ) -> Result<Vec<ColumnMeta>, RowShiftError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name, type, pk FROM pragma_table_info(?1, ?2)")?;
        let rows = stmt.query_map([table, schema.name()], |row| {
            Ok(ColumnMeta {
                name: row.get(0)?,
                declared_type: row.get(1)?,
                primary_key_ordinal: row.get(2)?,
            })
        })?;

        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }
        Ok(columns)
    }

    /// Collect one text column of a query's result set.
    pub fn get_values(&self, sql: &str, column: usize) -> Result<BTreeSet<String>, RowShiftError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(column))?;

        let mut values = BTreeSet::new();
        for row in rows {
            values.insert(row?);
        }
        Ok(values)
    }

    /// Drop every statement in the engine's statement cache. Cached
    /// statements are bound to a schema, so the stepper flushes here on
    /// every reattach.
    pub fn flush_statement_cache(&self) {
        self.conn.flush_prepared_statement_cache();
    }
}
