//! # batch-upsert
//!
//! Conflict-aware batched upsert engine.
//!
//! Given a stream of incoming rows that must be inserted or, on a
//! uniqueness conflict, turned into updates, this library:
//!
//! - **Classifies database errors** by vendor-specific codes or SQLSTATE to
//!   recognize "duplicate key" conditions across dialects
//! - **Extracts the violated constraint** from vendor error text and maps
//!   it back to the columns that must drive the corrective update
//! - **Accounts batched execution** under the three-way outcome convention
//!   (affected / failed / indeterminate)
//! - **Caches one prepared update per conflict shape**, with scoped release
//!
//! Dialect behavior is data, not code: each supported database contributes
//! a [`ProfileSpec`] row (codes, index-name pattern, quoting), and new
//! dialects can be registered or merged from JSON without touching engine
//! logic. Unknown database types degrade to "cannot classify conflicts"
//! rather than failing the run.
//!
//! ## Example
//!
//! ```rust,ignore
//! use batch_upsert::{DialectRegistry, UpsertWorker};
//!
//! let registry = DialectRegistry::with_builtins();
//! let mut worker = UpsertWorker::new(
//!     connection, // Box<dyn Connection> from the driver layer
//!     table,
//!     vec!["id".into()],
//!     vec!["name".into(), "email".into()],
//!     &registry,
//!     500,
//! )?;
//!
//! for row in rows {
//!     if let Some(outcomes) = worker.push(row)? {
//!         report(outcomes);
//!     }
//! }
//! let (tail, stats) = worker.finish()?;
//! ```

pub mod catalog;
pub mod classify;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod outcome;
pub mod schema;
pub mod statement;
pub mod value;
pub mod worker;

// Re-exports for convenient access
pub use catalog::IndexCatalog;
pub use classify::{
    columns_needing_extra_handling, identifying_code, is_duplicate_key, resolve_conflict_columns,
    ConflictResolution,
};
pub use dialect::{DialectProfile, DialectRegistry, ProfileSpec, QuoteStyle};
pub use driver::{
    BatchError, CancelFlag, Connection, DbError, PreparedStatement, EXECUTE_FAILED,
    SUCCESS_NO_INFO,
};
pub use error::{ReleaseFailures, Result, UpsertError};
pub use outcome::{BatchOutcome, EntryOutcome};
pub use schema::{Column, Index, Table};
pub use statement::{ColumnSetKey, StatementCache, StatementHandle};
pub use value::SqlValue;
pub use worker::{RowOutcome, UpsertStats, UpsertWorker};
