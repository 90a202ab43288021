//! # rowshift
//!
//! Incremental, self-pacing table migration for embedded SQLite databases.
//!
//! rowshift moves rows from a "source" table in an attached database file
//! into a "destination" table in the main database, transparently to
//! concurrent application traffic. Migration proceeds row by row in short
//! transactions whose duration is sized adaptively, so the migration never
//! monopolises the writer.
//!
//! The crate provides:
//!
//! - [`MigrateHandle`]: the per-worker stepper that attaches source
//!   schemas, moves budgeted batches of rows, deletes migrated rows from
//!   the source, and drops the source table once drained.
//! - [`MigrationUserInfo`] / [`MigrationInfo`]: immutable descriptors
//!   binding a destination table to its source and producing the migration
//!   SQL.
//! - [`EventHub`]: a process-wide hub installing the engine's global hooks
//!   (log, file-open, lock instrumentation) and fanning events out to
//!   named observers.
//! - [`Notifier`]: a process-wide sink for structured error records;
//!   migration failures arrive tagged with `action = "migrate"`.
//!
//! ```no_run
//! use rowshift::{Database, EventHub, MigrateHandle, MigrationInfo, MigrationUserInfo};
//!
//! # fn main() -> Result<(), rowshift::RowShiftError> {
//! // Install engine hooks before the first connection is opened.
//! EventHub::initialize();
//!
//! let db = Database::open(std::path::Path::new("app.db"))?;
//! let mut handle = MigrateHandle::new(db);
//!
//! let mut user_info = MigrationUserInfo::new("tracks");
//! user_info.set_source("tracks", "legacy.db");
//!
//! let table_columns = handle.get_columns_of_user_info(&user_info)?;
//! let info = MigrationInfo::new(
//!     &user_info,
//!     &table_columns.columns,
//!     table_columns.has_integer_primary_key,
//! );
//!
//! // Drive the stepper until the source is drained, then drop it.
//! while !handle.migrate_rows(&info)? {}
//! handle.drop_source_table(&info)?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod error;
pub mod events;
pub mod migration;
pub mod notifier;
pub mod schema;

pub use database::Database;
pub use error::{ErrorCode, RowShiftError};
pub use events::{ConnectionToken, EventHub, LockEventObserver, PagerLock, ShmLock};
pub use migration::{MigrateHandle, MigrationInfo, MigrationUserInfo, TableColumns};
pub use notifier::{ErrorRecord, Level, Notifier};
pub use schema::Schema;
