//! Database driver boundary.
//!
//! The engine never links a concrete database driver. The surrounding
//! framework supplies a live connection behind the [`Connection`] trait, and
//! the driver reports failures as [`DbError`] values exposing the fields the
//! conflict classifier needs: an optional SQLSTATE, a vendor-specific numeric
//! code, a message string, and an optional nested cause.
//!
//! Batched execution follows the three-way outcome-code convention: a
//! non-negative code is the affected-row count for that entry,
//! [`EXECUTE_FAILED`] marks a failed entry, and [`SUCCESS_NO_INFO`] marks a
//! succeeded entry with an unknown count.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::value::SqlValue;

/// Per-entry outcome code: the statement failed.
pub const EXECUTE_FAILED: i32 = -3;

/// Per-entry outcome code: the statement succeeded but the affected-row
/// count is unknown.
pub const SUCCESS_NO_INFO: i32 = -2;

/// Vendor code value meaning "unset". Cause-chain walks skip levels whose
/// code is this sentinel.
pub const VENDOR_CODE_UNSET: i32 = 0;

/// An error raised by the database driver layer.
///
/// The cause slot is write-once and holds an `Arc`, so wrapped errors are
/// cheap to share and synthetic cyclic chains (some drivers wrap an error as
/// its own cause) are expressible in tests. All traversal is done through
/// [`DbError::chain`], which is cycle-safe.
#[derive(Clone, Default)]
pub struct DbError {
    message: String,
    sql_state: Option<String>,
    vendor_code: i32,
    cause: OnceLock<Arc<DbError>>,
}

impl DbError {
    /// Create a new driver error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        DbError {
            message: message.into(),
            sql_state: None,
            vendor_code: VENDOR_CODE_UNSET,
            cause: OnceLock::new(),
        }
    }

    /// Attach a SQLSTATE code.
    pub fn with_sql_state(mut self, state: impl Into<String>) -> Self {
        self.sql_state = Some(state.into());
        self
    }

    /// Attach a vendor-specific numeric code.
    pub fn with_vendor_code(mut self, code: i32) -> Self {
        self.vendor_code = code;
        self
    }

    /// Wrap another error as the cause of this one.
    pub fn caused_by(self, cause: DbError) -> Self {
        let _ = self.cause.set(Arc::new(cause));
        self
    }

    /// Set the cause after construction. Returns false if a cause was
    /// already present.
    pub fn set_cause(&self, cause: Arc<DbError>) -> bool {
        self.cause.set(cause).is_ok()
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The SQLSTATE category code, if the driver reported one.
    pub fn sql_state(&self) -> Option<&str> {
        self.sql_state.as_deref()
    }

    /// The vendor-specific numeric code (0 when unset).
    pub fn vendor_code(&self) -> i32 {
        self.vendor_code
    }

    /// The nested cause, if any.
    pub fn cause(&self) -> Option<&Arc<DbError>> {
        self.cause.get()
    }

    /// Iterate this error and its causes, outermost first.
    ///
    /// Terminates on cyclic chains by tracking visited node identities.
    pub fn chain(&self) -> CauseChain<'_> {
        CauseChain {
            next: Some(self),
            seen: Vec::new(),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(state) = &self.sql_state {
            write!(f, " (SQLSTATE {})", state)?;
        }
        if self.vendor_code != VENDOR_CODE_UNSET {
            write!(f, " (code {})", self.vendor_code)?;
        }
        Ok(())
    }
}

// Manual Debug: deriving would recurse forever on cyclic cause chains.
impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbError")
            .field("message", &self.message)
            .field("sql_state", &self.sql_state)
            .field("vendor_code", &self.vendor_code)
            .field("has_cause", &self.cause.get().is_some())
            .finish()
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .get()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Cycle-safe iterator over an error and its nested causes.
pub struct CauseChain<'a> {
    next: Option<&'a DbError>,
    seen: Vec<*const DbError>,
}

impl<'a> Iterator for CauseChain<'a> {
    type Item = &'a DbError;

    fn next(&mut self) -> Option<&'a DbError> {
        let current = self.next.take()?;
        let identity = current as *const DbError;
        if self.seen.contains(&identity) {
            return None;
        }
        self.seen.push(identity);
        self.next = current.cause().map(|arc| arc.as_ref());
        Some(current)
    }
}

/// Batch execution failure: the per-entry outcome codes gathered before the
/// failure, plus the triggering driver error.
#[derive(Debug)]
pub struct BatchError {
    /// Outcome codes for the entries the driver reported on, order-aligned
    /// with the order rows were added to the batch.
    pub codes: Vec<i32>,

    /// The error that interrupted the batch.
    pub error: DbError,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch execution failed after {} entries: {}",
            self.codes.len(),
            self.error
        )
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A prepared, parameterized statement owned by the driver.
pub trait PreparedStatement: Send {
    /// Add one parameter row to the pending batch.
    fn add_batch(&mut self, row: &[SqlValue<'static>]) -> Result<(), DbError>;

    /// Execute the pending batch, returning per-entry outcome codes in the
    /// order rows were added.
    fn execute_batch(&mut self) -> Result<Vec<i32>, BatchError>;

    /// Execute once with the given parameters, returning the affected-row
    /// count.
    fn execute(&mut self, params: &[SqlValue<'static>]) -> Result<u64, DbError>;

    /// Release the underlying statement resource.
    fn close(&mut self) -> Result<(), DbError>;
}

/// A live database connection supplied by the caller.
pub trait Connection: Send {
    /// The declared database-type identifier, used to resolve the dialect
    /// profile (e.g. "mysql", "postgres").
    fn database_type(&self) -> &str;

    /// Prepare a statement for repeated execution.
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError>;
}

/// Cooperative cancellation flag for in-flight batches.
///
/// The owning caller trips the flag; the worker observes it before executing
/// a batch and surfaces the abort. A cancelled batch is never accounted as
/// partial success.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, untripped flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
