//! The migration stepper.
//!
//! A [`MigrateHandle`] owns one database connection and moves rows from an
//! attached source table into a destination table in the main schema, one
//! row at a time inside short transactions sized by the duration sampler.
//! A handle is single-threaded; a worker drives it by calling
//! [`MigrateHandle::migrate_rows`] until it reports the source drained,
//! then [`MigrateHandle::drop_source_table`].

use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info};
use rusqlite::Connection;

use crate::database::Database;
use crate::error::RowShiftError;
use crate::notifier::{ErrorRecord, Level, Notifier, ACTION_MIGRATE, INFO_KEY_ACTION, INFO_KEY_PATH};
use crate::schema::{quote_identifier, ColumnMeta, Schema, BUILTIN_TABLE_PREFIX};

use super::info::{MigrationInfo, MigrationUserInfo};
use super::sampler::DurationSampler;

/// Reflected shape of a destination table.
#[derive(Clone, Debug, Default)]
pub struct TableColumns {
    /// Whether one column aliases the rowid (single INTEGER primary key).
    pub has_integer_primary_key: bool,
    pub columns: BTreeSet<String>,
}

/// The SQL pair the stepper runs per row. Set and cleared together; the
/// engine's statement cache keeps the compiled forms warm between calls.
#[derive(Debug)]
struct StatementPair {
    migrate: String,
    delete: String,
}

/// Per-worker migration stepper bound to one database connection.
#[derive(Debug)]
pub struct MigrateHandle {
    db: Database,
    attached: Schema,
    active_info: Option<MigrationInfo>,
    statements: Option<StatementPair>,
    sampler: DurationSampler,
}

impl MigrateHandle {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            attached: Schema::main(),
            active_info: None,
            statements: None,
            sampler: DurationSampler::new(),
        }
    }

    pub fn open(db_path: &Path) -> Result<Self, RowShiftError> {
        Ok(Self::new(Database::open(db_path)?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// All user tables in the main schema, excluding the engine's built-in
    /// tables.
    pub fn get_all_tables(&self) -> Result<BTreeSet<String>, RowShiftError> {
        let sql = format!(
            "SELECT name FROM main.sqlite_master \
             WHERE type='table' AND name NOT LIKE '{BUILTIN_TABLE_PREFIX}%'",
        );
        self.db.get_values(&sql, 0)
    }

    /// Whether the source table named by `user_info` exists, attaching its
    /// source database first.
    pub fn source_table_exists(
        &mut self,
        user_info: &MigrationUserInfo,
    ) -> Result<bool, RowShiftError> {
        let schema = user_info.source_schema();
        self.reattach(user_info.source_database(), &schema)?;
        self.db.table_exists(&schema, user_info.source_table())
    }

    /// Reflect the destination table of `user_info` in the main schema.
    /// A missing destination yields empty columns and no integer primary
    /// key.
    pub fn get_columns_of_user_info(
        &self,
        user_info: &MigrationUserInfo,
    ) -> Result<TableColumns, RowShiftError> {
        if !self.db.table_exists(&Schema::Main, user_info.table())? {
            return Ok(TableColumns::default());
        }

        let metas = self.db.get_table_meta(&Schema::Main, user_info.table())?;
        Ok(TableColumns {
            has_integer_primary_key: ColumnMeta::index_of_integer_primary(&metas).is_some(),
            columns: metas.into_iter().map(|meta| meta.name).collect(),
        })
    }

    /// Drop the drained source table along with its triggers and indices.
    pub fn drop_source_table(&mut self, migration_info: &MigrationInfo) -> Result<(), RowShiftError> {
        match self.drop_source_table_inner(migration_info) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.notify_failure(&err);
                Err(err)
            }
        }
    }

    fn drop_source_table_inner(&mut self, migration_info: &MigrationInfo) -> Result<(), RowShiftError> {
        self.reattach(migration_info.source_database(), migration_info.source_schema())?;
        self.active_info = Some(migration_info.clone());
        self.db.execute(&migration_info.stmt_drop_source_table())?;
        info!("Dropped drained source table {}", migration_info.source_table());
        Ok(())
    }

    /// Move a batch of rows within one budgeted transaction. Returns
    /// whether the source is drained; an error means no progress was
    /// committed and the handle can retry cheaply.
    pub fn migrate_rows(&mut self, migration_info: &MigrationInfo) -> Result<bool, RowShiftError> {
        match self.migrate_rows_inner(migration_info) {
            Ok(done) => Ok(done),
            Err(err) => {
                self.notify_failure(&err);
                Err(err)
            }
        }
    }

    fn migrate_rows_inner(&mut self, migration_info: &MigrationInfo) -> Result<bool, RowShiftError> {
        // A destination that was never created means there is nothing to
        // migrate into.
        if !self.db.table_exists(&Schema::Main, migration_info.table())? {
            return Ok(true);
        }

        if self.active_info.as_ref() != Some(migration_info) {
            self.reattach(migration_info.source_database(), migration_info.source_schema())?;
            self.active_info = Some(migration_info.clone());
        }

        // A source that is already gone (e.g. dropped after a previous
        // drain) has nothing left to move.
        if !self
            .db
            .table_exists(migration_info.source_schema(), migration_info.source_table())?
        {
            return Ok(true);
        }

        let (migrate_sql, delete_sql) = match self.statements.as_ref() {
            Some(pair) => (pair.migrate.clone(), pair.delete.clone()),
            None => {
                let migrate = migration_info.stmt_migrate_one_row();
                let delete = migration_info.stmt_delete_migrated_one_row();
                // Surface prepare failures before opening the transaction.
                self.db.conn().prepare_cached(&migrate)?;
                self.db.conn().prepare_cached(&delete)?;
                self.statements = Some(StatementPair {
                    migrate: migrate.clone(),
                    delete: delete.clone(),
                });
                (migrate, delete)
            }
        };

        let budget = self.sampler.next_budget();
        let started = Instant::now();

        let (drained, moved, within_transaction) = self.db.run_transaction(|conn| {
            let mut moved = 0usize;
            let (drained, within_transaction) = loop {
                let drained = Self::migrate_one_row(conn, &migrate_sql, &delete_sql)?;
                let within_transaction = started.elapsed();
                if !drained {
                    moved += 1;
                }
                if drained || within_transaction >= budget {
                    break (drained, within_transaction);
                }
            };
            Ok((drained, moved, within_transaction))
        })?;

        let whole_transaction = started.elapsed();
        // A transaction that moved nothing carries no pacing signal.
        if moved > 0
            && within_transaction > Duration::ZERO
            && whole_transaction > within_transaction
        {
            self.sampler
                .record(within_transaction, whole_transaction);
        }

        if drained {
            debug!(
                "Source table {} drained ({moved} rows moved in final transaction)",
                migration_info.source_table(),
            );
        }
        Ok(drained)
    }

    /// Move one row and delete it from the source. Returns `true` when the
    /// source turned out to be drained.
    fn migrate_one_row(
        conn: &Connection,
        migrate_sql: &str,
        delete_sql: &str,
    ) -> Result<bool, RowShiftError> {
        debug_assert!(!conn.is_autocommit());

        let moved = conn.prepare_cached(migrate_sql)?.execute([])?;
        if moved == 0 {
            return Ok(true);
        }
        conn.prepare_cached(delete_sql)?.execute([])?;
        Ok(false)
    }

    /// Switch the handle's migration context to `(path, schema)`. The
    /// active info and the statement pair are invalidated even when the
    /// target schema is already attached.
    pub fn reattach(&mut self, path: &str, schema: &Schema) -> Result<(), RowShiftError> {
        debug_assert!(!self.db.is_in_transaction());

        // Statements are bound to the schema they were prepared against.
        self.active_info = None;
        self.finalize_migration_statements();

        if !self.attached.targets_same_schema(schema) {
            self.detach()?;
            self.attach(path, schema)?;
        }
        Ok(())
    }

    fn attach(&mut self, path: &str, schema: &Schema) -> Result<(), RowShiftError> {
        debug_assert!(!self.db.is_in_transaction());
        debug_assert!(self.statements.is_none());
        debug_assert!(self.attached.is_main());

        if !schema.is_main() {
            let sql = format!("ATTACH DATABASE ?1 AS {}", quote_identifier(schema.name()));
            self.db.execute_with_path_param(&sql, path)?;
            self.attached = schema.clone();
            debug!("Attached {path} as schema {}", schema.name());
        }
        Ok(())
    }

    fn detach(&mut self) -> Result<(), RowShiftError> {
        debug_assert!(!self.db.is_in_transaction());
        debug_assert!(self.statements.is_none());

        if !self.attached.is_main() {
            let sql = format!("DETACH DATABASE {}", quote_identifier(self.attached.name()));
            self.db.execute(&sql)?;
            debug!("Detached schema {}", self.attached.name());
            self.attached = Schema::Main;
        }
        Ok(())
    }

    fn finalize_migration_statements(&mut self) {
        self.statements = None;
        self.db.flush_statement_cache();
    }

    fn notify_failure(&self, err: &RowShiftError) {
        Notifier::shared().notify(
            &ErrorRecord::new(Level::Error, err.engine_code(), err.to_string())
                .with_info(INFO_KEY_ACTION, ACTION_MIGRATE)
                .with_info(INFO_KEY_PATH, self.db.path()),
        );
    }
}
