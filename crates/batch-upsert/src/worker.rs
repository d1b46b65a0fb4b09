//! Upsert worker: batched insert with conflict-corrective updates.
//!
//! One worker owns one database connection, one target table, and the
//! statement handle cache for that table. Rows are buffered into an insert
//! batch; when the batch flushes, each failed entry is classified and, if it
//! is a resolvable duplicate-key conflict, corrected with an UPDATE keyed on
//! the violated constraint's columns. Each row gets exactly one outcome,
//! order-aligned with the order it was pushed.
//!
//! Corrective updates are never retried: a second conflict on the corrected
//! row is terminal for that row, which keeps conflict loops bounded.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::IndexCatalog;
use crate::classify::{columns_needing_extra_handling, is_duplicate_key, resolve_conflict_columns};
use crate::dialect::{DialectProfile, DialectRegistry};
use crate::driver::{BatchError, CancelFlag, Connection, DbError};
use crate::error::{ReleaseFailures, Result, UpsertError};
use crate::outcome::{BatchOutcome, EntryOutcome};
use crate::schema::Table;
use crate::statement::{self, ColumnSetKey, StatementCache, StatementHandle};
use crate::value::SqlValue;

/// Final disposition of one input row.
#[derive(Debug)]
pub enum RowOutcome {
    /// The row was inserted.
    Inserted,

    /// The insert conflicted and the row was corrected with an UPDATE keyed
    /// on these columns.
    UpdatedAfterConflict(Vec<String>),

    /// The row failed terminally; the error says why (unresolvable
    /// conflict, non-conflict database error, or cancellation).
    Failed(UpsertError),
}

impl RowOutcome {
    /// Whether this row failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, RowOutcome::Failed(_))
    }
}

/// Aggregate statistics across all flushed batches, for observability.
#[derive(Debug, Clone, Default)]
pub struct UpsertStats {
    /// Rows that reached a terminal state.
    pub rows: u64,

    /// Rows inserted (including indeterminate-count successes).
    pub inserted: u64,

    /// Rows corrected with an UPDATE after a conflict.
    pub updated: u64,

    /// Rows that failed terminally.
    pub failed: u64,

    /// Insert entries whose affected count was unknown.
    pub indeterminate: u64,

    /// Sum of reported affected-row counts (inserts and updates).
    pub rows_affected: u64,
}

impl UpsertStats {
    /// Merge another stats block into this one.
    pub fn merge(&mut self, other: &UpsertStats) {
        self.rows += other.rows;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
        self.indeterminate += other.indeterminate;
        self.rows_affected += other.rows_affected;
    }
}

/// Conflict-aware batched upsert worker for one target table.
///
/// Owned by one parallel execution copy; workers never share a connection,
/// a cache, or a catalog.
pub struct UpsertWorker {
    connection: Box<dyn Connection>,
    table: Table,
    profile: Arc<DialectProfile>,
    catalog: IndexCatalog,
    update_columns: Vec<String>,
    insert: StatementHandle,
    cache: StatementCache,
    pending: Vec<Vec<SqlValue<'static>>>,
    batch_size: usize,
    cancel: CancelFlag,
    stats: UpsertStats,
}

impl UpsertWorker {
    /// Create a worker for one target table over a live connection.
    ///
    /// Resolves the dialect profile from the connection's declared database
    /// type, snapshots the table's unique indexes, and prepares the insert
    /// statement. Warns about indexed columns covered by neither the lookup
    /// keys nor the update columns: conflicts on those cannot be corrected.
    pub fn new(
        mut connection: Box<dyn Connection>,
        table: Table,
        lookup_keys: Vec<String>,
        update_columns: Vec<String>,
        registry: &DialectRegistry,
        batch_size: usize,
    ) -> Result<Self> {
        let profile = registry.resolve(connection.database_type())?;
        let catalog = IndexCatalog::from_table(&table)?;

        // Validate the caller's column lists up front.
        statement::bind_slots(&table, &lookup_keys)?;
        statement::bind_slots(&table, &update_columns)?;

        let blind_spots = columns_needing_extra_handling(&catalog, &lookup_keys, &update_columns);
        if !blind_spots.is_empty() {
            warn!(
                table = %table.full_name(),
                columns = ?blind_spots,
                "uniquely indexed columns covered by neither lookup keys nor update columns; \
                 conflicts on them cannot be corrected"
            );
        }
        if !profile.can_classify() {
            warn!(
                dialect = profile.name(),
                "dialect cannot classify duplicate-key conflicts; conflicting rows will fail"
            );
        }

        let column_names = table.column_names();
        let insert_sql = statement::build_insert(&profile, &table, &column_names);
        let prepared = connection.prepare(&insert_sql)?;
        let insert = StatementHandle::new(prepared, (0..column_names.len()).collect());

        let batch_size = batch_size.max(1);
        info!(
            table = %table.full_name(),
            dialect = profile.name(),
            batch_size,
            "upsert worker ready"
        );

        Ok(UpsertWorker {
            connection,
            table,
            profile,
            catalog,
            update_columns,
            insert,
            cache: StatementCache::new(),
            pending: Vec::with_capacity(batch_size),
            batch_size,
            cancel: CancelFlag::new(),
            stats: UpsertStats::default(),
        })
    }

    /// A flag the owning caller can trip to cancel in-flight work.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Statistics accumulated so far.
    pub fn stats(&self) -> &UpsertStats {
        &self.stats
    }

    /// Rows buffered but not yet flushed.
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// Buffer a row; flushes automatically when the batch fills.
    ///
    /// Returns the flushed outcomes when a flush happened, `None` otherwise.
    pub fn push(&mut self, row: Vec<SqlValue<'static>>) -> Result<Option<Vec<RowOutcome>>> {
        if row.len() != self.table.columns.len() {
            return Err(UpsertError::config(format!(
                "row has {} values but {} has {} columns",
                row.len(),
                self.table.full_name(),
                self.table.columns.len()
            )));
        }
        self.pending.push(row);
        if self.pending.len() >= self.batch_size {
            return Ok(Some(self.flush()?));
        }
        Ok(None)
    }

    /// Execute the pending insert batch and settle every row.
    ///
    /// Outcomes are order-aligned with the pushed rows. A cancelled batch is
    /// surfaced as an abort, never as partial success; an outcome code
    /// outside the accounting convention aborts the batch.
    pub fn flush(&mut self) -> Result<Vec<RowOutcome>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        if self.cancel.is_cancelled() {
            return Err(UpsertError::Cancelled);
        }

        let rows = std::mem::take(&mut self.pending);
        for row in &rows {
            self.insert.add_batch(row)?;
        }

        let (mut codes, batch_error) = match self.insert.execute_batch() {
            Ok(codes) => (codes, None),
            Err(BatchError { codes, error }) => (codes, Some(error)),
        };

        if codes.len() != rows.len() {
            match &batch_error {
                // The driver stopped mid-batch; entries it never reported on
                // are failures against the triggering error.
                Some(_) => codes.resize(rows.len(), crate::driver::EXECUTE_FAILED),
                None => {
                    return Err(UpsertError::Database(DbError::new(format!(
                        "driver reported {} outcome codes for a batch of {} rows",
                        codes.len(),
                        rows.len()
                    ))));
                }
            }
        }

        let accounting = BatchOutcome::classify(&codes, &self.profile)?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for (i, entry) in accounting.entries.iter().enumerate() {
            let outcome = match entry {
                EntryOutcome::Affected(_) => {
                    self.stats.inserted += 1;
                    RowOutcome::Inserted
                }
                EntryOutcome::Indeterminate => {
                    self.stats.inserted += 1;
                    self.stats.indeterminate += 1;
                    RowOutcome::Inserted
                }
                EntryOutcome::Failed => self.settle_failed_row(&rows[i], batch_error.as_ref()),
            };
            outcomes.push(outcome);
        }

        self.stats.rows += rows.len() as u64;
        self.stats.rows_affected += accounting.rows_affected;

        debug!(
            table = %self.table.full_name(),
            rows = rows.len(),
            affected = accounting.affected,
            failed = accounting.failed,
            indeterminate = accounting.indeterminate,
            "batch settled"
        );

        Ok(outcomes)
    }

    /// Flush the tail and release every statement handle.
    ///
    /// Release failures are collected and reported once, as a single
    /// aggregate; they never mask each other. Handles are also released by
    /// `Drop` on early-abort paths.
    pub fn finish(mut self) -> Result<(Vec<RowOutcome>, UpsertStats)> {
        let tail = self.flush()?;

        let mut failures = Vec::new();
        if let Err(e) = self.insert.close() {
            warn!(error = %e, "failed to close insert statement");
            failures.push(e);
        }
        match self.cache.invalidate_all() {
            Ok(()) => {}
            Err(UpsertError::ResourceRelease(ReleaseFailures(more))) => failures.extend(more),
            Err(other) => return Err(other),
        }

        let stats = std::mem::take(&mut self.stats);
        info!(
            table = %self.table.full_name(),
            rows = stats.rows,
            inserted = stats.inserted,
            updated = stats.updated,
            failed = stats.failed,
            "upsert worker finished"
        );

        if failures.is_empty() {
            Ok((tail, stats))
        } else {
            Err(UpsertError::ResourceRelease(ReleaseFailures(failures)))
        }
    }

    /// Settle one failed batch entry: classify the conflict, resolve its
    /// columns, and run the corrective update.
    fn settle_failed_row(
        &mut self,
        row: &[SqlValue<'static>],
        error: Option<&DbError>,
    ) -> RowOutcome {
        let Some(error) = error else {
            self.stats.failed += 1;
            return RowOutcome::Failed(UpsertError::Database(DbError::new(
                "batch entry failed but the driver reported no error",
            )));
        };

        if !is_duplicate_key(&self.profile, error) {
            self.stats.failed += 1;
            return RowOutcome::Failed(UpsertError::Database(error.clone()));
        }

        let resolution = resolve_conflict_columns(&self.catalog, &self.profile, error);
        if !resolution.is_resolved() {
            self.stats.failed += 1;
            let message = match &resolution.matched_index {
                Some(name) => format!("constraint '{}' is not a known unique index", name),
                None => "no constraint name matched in the error message".to_string(),
            };
            return RowOutcome::Failed(UpsertError::unresolvable(self.table.full_name(), message));
        }

        // Columns to rewrite: the caller's update set minus the conflict key
        // itself.
        let set_columns: Vec<String> = self
            .update_columns
            .iter()
            .filter(|c| {
                !resolution
                    .columns
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(c))
            })
            .cloned()
            .collect();

        if set_columns.is_empty() {
            // The conflicting constraint already covers every updatable
            // column; the duplicate needs no correction.
            debug!(
                table = %self.table.full_name(),
                index = ?resolution.matched_index,
                "conflict needs no corrective update"
            );
            self.stats.updated += 1;
            return RowOutcome::UpdatedAfterConflict(resolution.columns);
        }

        let key = ColumnSetKey::new(&resolution.columns);
        let connection = &mut self.connection;
        let table = &self.table;
        let profile = &self.profile;
        let created = self.cache.get_or_create(&key, || {
            let sql = statement::build_update(profile, table, &set_columns, &resolution.columns);
            debug!(sql = %sql, "preparing corrective update");
            let prepared = connection.prepare(&sql)?;
            let mut slots = statement::bind_slots(table, &set_columns)?;
            slots.extend(statement::bind_slots(table, &resolution.columns)?);
            Ok(StatementHandle::new(prepared, slots))
        });

        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                self.stats.failed += 1;
                return RowOutcome::Failed(e);
            }
        };

        let mut guard = handle
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.execute_for_row(row) {
            Ok(affected) => {
                self.stats.updated += 1;
                self.stats.rows_affected += affected;
                RowOutcome::UpdatedAfterConflict(resolution.columns)
            }
            Err(e) => {
                // Corrective updates are terminal; no retry.
                self.stats.failed += 1;
                RowOutcome::Failed(UpsertError::Database(e))
            }
        }
    }
}

impl std::fmt::Debug for UpsertWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsertWorker")
            .field("table", &self.table.full_name())
            .field("dialect", &self.profile.name())
            .field("batch_size", &self.batch_size)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_merge() {
        let mut a = UpsertStats {
            rows: 10,
            inserted: 7,
            updated: 2,
            failed: 1,
            indeterminate: 3,
            rows_affected: 9,
        };
        let b = UpsertStats {
            rows: 5,
            inserted: 5,
            updated: 0,
            failed: 0,
            indeterminate: 0,
            rows_affected: 5,
        };
        a.merge(&b);
        assert_eq!(a.rows, 15);
        assert_eq!(a.inserted, 12);
        assert_eq!(a.rows_affected, 14);
    }

    #[test]
    fn test_row_outcome_is_failed() {
        assert!(!RowOutcome::Inserted.is_failed());
        assert!(!RowOutcome::UpdatedAfterConflict(vec![]).is_failed());
        assert!(RowOutcome::Failed(UpsertError::Cancelled).is_failed());
    }
}
