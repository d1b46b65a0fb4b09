//! Batch accounting: classifying per-entry outcome codes.
//!
//! Classification is total: every raw code lands in exactly one of three
//! buckets (affected / failed / indeterminate), and anything outside the
//! convention aborts the batch. Silently miscounting is worse than stopping.

use crate::dialect::DialectProfile;
use crate::driver::{EXECUTE_FAILED, SUCCESS_NO_INFO};
use crate::error::{Result, UpsertError};

/// Classification of one batch entry's outcome code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry succeeded; the value is its affected-row count.
    Affected(i64),

    /// The entry failed.
    Failed,

    /// The entry succeeded but the driver did not report a count. Only legal
    /// for dialects that do not report per-row outcomes.
    Indeterminate,
}

/// Accounted result of one batch execution.
///
/// Entry order is preserved from the order rows were added to the batch;
/// accounting never reorders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Per-entry classification, order-aligned with the batch.
    pub entries: Vec<EntryOutcome>,

    /// Number of entries that reported an affected-row count.
    pub affected: usize,

    /// Sum of reported affected-row counts.
    pub rows_affected: u64,

    /// Number of failed entries.
    pub failed: usize,

    /// Number of indeterminate entries.
    pub indeterminate: usize,
}

impl BatchOutcome {
    /// Classify a batch's raw outcome codes under a dialect profile.
    ///
    /// Fails with [`UpsertError::UnexpectedOutcomeCode`] on any code outside
    /// the three-way convention, returning no partial counts.
    pub fn classify(raw_codes: &[i32], profile: &DialectProfile) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            entries: Vec::with_capacity(raw_codes.len()),
            ..BatchOutcome::default()
        };

        for (index, &code) in raw_codes.iter().enumerate() {
            let entry = if code >= 0 {
                outcome.affected += 1;
                outcome.rows_affected += code as u64;
                EntryOutcome::Affected(code as i64)
            } else if code == EXECUTE_FAILED {
                outcome.failed += 1;
                EntryOutcome::Failed
            } else if code == SUCCESS_NO_INFO && !profile.reports_per_row_outcome() {
                outcome.indeterminate += 1;
                EntryOutcome::Indeterminate
            } else {
                return Err(UpsertError::UnexpectedOutcomeCode { code, index });
            };
            outcome.entries.push(entry);
        }

        Ok(outcome)
    }

    /// Number of entries accounted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries were accounted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
