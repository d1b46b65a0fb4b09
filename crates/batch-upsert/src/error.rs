//! Error types for the upsert engine.

use std::fmt;

use thiserror::Error;

use crate::driver::DbError;

/// Main error type for upsert operations.
#[derive(Error, Debug)]
pub enum UpsertError {
    /// Configuration error (malformed dialect entry, unknown column, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A batch outcome code outside the three-way convention.
    ///
    /// Accounting aborts the batch rather than guessing at partial counts.
    #[error("Unexpected batch outcome code {code} at entry {index}")]
    UnexpectedOutcomeCode { code: i32, index: usize },

    /// A duplicate key was detected but could not be mapped to columns.
    #[error("Unresolvable conflict on {table}: {message}")]
    UnresolvableConflict { table: String, message: String },

    /// Database error not classified as a duplicate-key conflict.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// One or more statement handles failed to release cleanly.
    #[error("Resource release failed: {0}")]
    ResourceRelease(ReleaseFailures),

    /// The in-flight batch was cancelled by the owning caller.
    #[error("Upsert cancelled")]
    Cancelled,
}

impl UpsertError {
    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        UpsertError::Config(message.into())
    }

    /// Create an UnresolvableConflict error.
    pub fn unresolvable(table: impl Into<String>, message: impl Into<String>) -> Self {
        UpsertError::UnresolvableConflict {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Format error with full details including the error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Aggregate of close failures collected while releasing statement handles.
///
/// One bad close never prevents sibling releases; every failure is kept and
/// reported once at shutdown.
#[derive(Debug, Default)]
pub struct ReleaseFailures(pub Vec<DbError>);

impl ReleaseFailures {
    /// Number of handles that failed to close.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no release failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ReleaseFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} handle(s) failed to close", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "; [{}] {}", i, err)?;
        }
        Ok(())
    }
}

/// Result type alias for upsert operations.
pub type Result<T> = std::result::Result<T, UpsertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_failures_display() {
        let failures = ReleaseFailures(vec![
            DbError::new("cursor already closed"),
            DbError::new("connection reset"),
        ]);
        let text = failures.to_string();
        assert!(text.starts_with("2 handle(s) failed to close"));
        assert!(text.contains("[0] cursor already closed"));
        assert!(text.contains("[1] connection reset"));
    }

    #[test]
    fn test_format_detailed_walks_chain() {
        let inner = DbError::new("deadlock detected").with_vendor_code(1213);
        let err = UpsertError::Database(DbError::new("batch failed").caused_by(inner));
        let text = err.format_detailed();
        assert!(text.contains("batch failed"));
        assert!(text.contains("Caused by"));
        assert!(text.contains("deadlock detected"));
    }
}
