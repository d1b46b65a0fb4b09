//! Statement handles and the per-column-set handle cache.
//!
//! Different conflicts require different corrective UPDATE shapes, so the
//! worker keeps exactly one prepared statement per distinct column-set key,
//! created on first need and released when the worker shuts down. Release is
//! scoped: a handle frees its driver resource on every exit path, including
//! early abort, via `Drop`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::warn;

use crate::dialect::DialectProfile;
use crate::driver::{BatchError, DbError, PreparedStatement};
use crate::error::{ReleaseFailures, Result, UpsertError};
use crate::schema::Table;
use crate::value::SqlValue;

/// Build the batched INSERT for the full row shape.
///
/// Placeholders are positional `?`; translating to the driver's native
/// placeholder style is the driver layer's concern.
pub fn build_insert(profile: &DialectProfile, table: &Table, columns: &[String]) -> String {
    let cols = columns
        .iter()
        .map(|c| profile.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {}.{} ({}) VALUES ({})",
        profile.quote_ident(&table.schema),
        profile.quote_ident(&table.name),
        cols,
        placeholders
    )
}

/// Build the corrective UPDATE for one conflict column set.
pub fn build_update(
    profile: &DialectProfile,
    table: &Table,
    set_columns: &[String],
    key_columns: &[String],
) -> String {
    let assignments = set_columns
        .iter()
        .map(|c| format!("{} = ?", profile.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let conditions = key_columns
        .iter()
        .map(|c| format!("{} = ?", profile.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "UPDATE {}.{} SET {} WHERE {}",
        profile.quote_ident(&table.schema),
        profile.quote_ident(&table.name),
        assignments,
        conditions
    )
}

/// Map logical column names to their positions in the row shape.
pub fn bind_slots(table: &Table, columns: &[String]) -> Result<Vec<usize>> {
    columns
        .iter()
        .map(|c| {
            table.column_index(c).ok_or_else(|| {
                UpsertError::config(format!(
                    "column '{}' not found in table {}",
                    c,
                    table.full_name()
                ))
            })
        })
        .collect()
}

/// Cache key: the ordered column set a corrective update is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnSetKey(Vec<String>);

impl ColumnSetKey {
    /// Create a key, preserving column order.
    pub fn new(columns: &[String]) -> Self {
        ColumnSetKey(columns.to_vec())
    }

    /// The columns in this key.
    pub fn columns(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ColumnSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// One prepared, reusable statement plus the positional mapping from the
/// full row shape to its bind slots.
pub struct StatementHandle {
    statement: Option<Box<dyn PreparedStatement>>,
    slots: Vec<usize>,
}

impl StatementHandle {
    /// Wrap a prepared statement with its bind-slot mapping.
    pub fn new(statement: Box<dyn PreparedStatement>, slots: Vec<usize>) -> Self {
        StatementHandle {
            statement: Some(statement),
            slots,
        }
    }

    /// The row positions this handle binds, in bind order.
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    fn statement_mut(&mut self) -> std::result::Result<&mut Box<dyn PreparedStatement>, DbError> {
        self.statement
            .as_mut()
            .ok_or_else(|| DbError::new("statement handle already closed"))
    }

    fn project(
        slots: &[usize],
        row: &[SqlValue<'static>],
    ) -> std::result::Result<Vec<SqlValue<'static>>, DbError> {
        slots
            .iter()
            .map(|&slot| {
                row.get(slot).cloned().ok_or_else(|| {
                    DbError::new(format!(
                        "bind slot {} out of bounds for row of {} values",
                        slot,
                        row.len()
                    ))
                })
            })
            .collect()
    }

    /// Add a row to the pending batch, projected through the slot mapping.
    pub fn add_batch(&mut self, row: &[SqlValue<'static>]) -> std::result::Result<(), DbError> {
        let params = Self::project(&self.slots, row)?;
        self.statement_mut()?.add_batch(&params)
    }

    /// Execute the pending batch.
    pub fn execute_batch(&mut self) -> std::result::Result<Vec<i32>, BatchError> {
        let statement = self.statement.as_mut().ok_or_else(|| BatchError {
            codes: Vec::new(),
            error: DbError::new("statement handle already closed"),
        })?;
        statement.execute_batch()
    }

    /// Execute once for a row, projected through the slot mapping. Returns
    /// the affected-row count.
    pub fn execute_for_row(
        &mut self,
        row: &[SqlValue<'static>],
    ) -> std::result::Result<u64, DbError> {
        let params = Self::project(&self.slots, row)?;
        self.statement_mut()?.execute(&params)
    }

    /// Release the underlying statement. Idempotent.
    pub fn close(&mut self) -> std::result::Result<(), DbError> {
        match self.statement.take() {
            Some(mut statement) => statement.close(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementHandle")
            .field("slots", &self.slots)
            .field("open", &self.statement.is_some())
            .finish()
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        if let Some(mut statement) = self.statement.take() {
            if let Err(e) = statement.close() {
                warn!(error = %e, "statement handle leaked a close failure on drop");
            }
        }
    }
}

/// Cache of one statement handle per distinct conflict column set.
///
/// Creation happens under the map lock, so two callers racing on the same
/// key cannot both prepare: the second observes and reuses the first's
/// handle. Handle state is behind a `RwLock` so metadata readers can proceed
/// together while execution and disposal take exclusive access.
#[derive(Default)]
pub struct StatementCache {
    handles: Mutex<HashMap<ColumnSetKey, Arc<RwLock<StatementHandle>>>>,
}

impl StatementCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.lock_handles().len()
    }

    /// True when no handles are cached.
    pub fn is_empty(&self) -> bool {
        self.lock_handles().is_empty()
    }

    /// Fetch the handle for a column set, preparing it via `create` if
    /// absent.
    pub fn get_or_create(
        &self,
        key: &ColumnSetKey,
        create: impl FnOnce() -> Result<StatementHandle>,
    ) -> Result<Arc<RwLock<StatementHandle>>> {
        let mut handles = self.lock_handles();
        if let Some(handle) = handles.get(key) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(RwLock::new(create()?));
        handles.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    /// Close every cached handle, collecting close failures.
    ///
    /// One bad close never prevents sibling releases; failures come back as
    /// a single [`UpsertError::ResourceRelease`] aggregate.
    pub fn invalidate_all(&self) -> Result<()> {
        let mut handles = self.lock_handles();
        let mut failures = Vec::new();

        for (key, handle) in handles.drain() {
            let mut guard = handle.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = guard.close() {
                warn!(key = %key, error = %e, "failed to close cached statement handle");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(UpsertError::ResourceRelease(ReleaseFailures(failures)))
        }
    }

    fn lock_handles(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ColumnSetKey, Arc<RwLock<StatementHandle>>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementCache")
            .field("keys", &self.lock_handles().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::dialect::DialectRegistry;
    use crate::schema::{Column, Table};

    struct StubStatement {
        fail_close: bool,
        closes: Arc<AtomicUsize>,
    }

    impl PreparedStatement for StubStatement {
        fn add_batch(&mut self, _row: &[SqlValue<'static>]) -> std::result::Result<(), DbError> {
            Ok(())
        }

        fn execute_batch(&mut self) -> std::result::Result<Vec<i32>, BatchError> {
            Ok(vec![])
        }

        fn execute(&mut self, _params: &[SqlValue<'static>]) -> std::result::Result<u64, DbError> {
            Ok(1)
        }

        fn close(&mut self) -> std::result::Result<(), DbError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(DbError::new("close failed"))
            } else {
                Ok(())
            }
        }
    }

    fn stub_handle(fail_close: bool, closes: &Arc<AtomicUsize>) -> StatementHandle {
        StatementHandle::new(
            Box::new(StubStatement {
                fail_close,
                closes: closes.clone(),
            }),
            vec![0],
        )
    }

    fn users_table() -> Table {
        let columns = ["id", "email", "name"]
            .iter()
            .enumerate()
            .map(|(i, name)| Column {
                name: name.to_string(),
                data_type: "varchar".to_string(),
                is_nullable: false,
                ordinal_pos: i as i32 + 1,
            })
            .collect();
        Table {
            schema: "public".to_string(),
            name: "users".to_string(),
            columns,
            primary_key: vec!["id".to_string()],
            primary_key_name: None,
            indexes: vec![],
        }
    }

    #[test]
    fn test_build_insert_sql() {
        let profile = DialectRegistry::with_builtins()
            .resolve("mysql")
            .expect("resolves");
        let table = users_table();
        let sql = build_insert(&profile, &table, &table.column_names());
        assert_eq!(
            sql,
            "INSERT INTO `public`.`users` (`id`, `email`, `name`) VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn test_build_update_sql() {
        let profile = DialectRegistry::with_builtins()
            .resolve("postgres")
            .expect("resolves");
        let table = users_table();
        let sql = build_update(
            &profile,
            &table,
            &["name".to_string()],
            &["email".to_string()],
        );
        assert_eq!(
            sql,
            "UPDATE \"public\".\"users\" SET \"name\" = ? WHERE \"email\" = ?"
        );
    }

    #[test]
    fn test_bind_slots_case_insensitive() {
        let table = users_table();
        let slots = bind_slots(&table, &["Name".to_string(), "ID".to_string()]).expect("maps");
        assert_eq!(slots, vec![2, 0]);

        assert!(bind_slots(&table, &["ghost".to_string()]).is_err());
    }

    #[test]
    fn test_column_set_key_order_matters() {
        let a = ColumnSetKey::new(&["a".to_string(), "b".to_string()]);
        let b = ColumnSetKey::new(&["b".to_string(), "a".to_string()]);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "a,b");
    }

    #[test]
    fn test_cache_creates_once_per_key() {
        let cache = StatementCache::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let key = ColumnSetKey::new(&["email".to_string()]);
        let creations = AtomicUsize::new(0);

        let first = cache
            .get_or_create(&key, || {
                creations.fetch_add(1, Ordering::SeqCst);
                Ok(stub_handle(false, &closes))
            })
            .expect("creates");
        let second = cache
            .get_or_create(&key, || {
                creations.fetch_add(1, Ordering::SeqCst);
                Ok(stub_handle(false, &closes))
            })
            .expect("reuses");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_all_aggregates_failures() {
        let cache = StatementCache::new();
        let closes = Arc::new(AtomicUsize::new(0));

        for (i, fail) in [true, false, true].iter().enumerate() {
            let key = ColumnSetKey::new(&[format!("col{}", i)]);
            cache
                .get_or_create(&key, || Ok(stub_handle(*fail, &closes)))
                .expect("creates");
        }

        let err = cache.invalidate_all().unwrap_err();
        match err {
            UpsertError::ResourceRelease(failures) => assert_eq!(failures.len(), 2),
            other => panic!("expected ResourceRelease, got {:?}", other),
        }
        // every handle was closed despite the failures
        assert_eq!(closes.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_handle_close_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handle = stub_handle(false, &closes);
        handle.close().expect("closes");
        handle.close().expect("second close is a no-op");
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_statement() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let _handle = stub_handle(false, &closes);
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_execute_for_row_projects_slots() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handle = StatementHandle::new(
            Box::new(StubStatement {
                fail_close: false,
                closes: closes.clone(),
            }),
            vec![2, 0],
        );
        let row = vec![
            SqlValue::I64(1),
            SqlValue::text("a@example.com"),
            SqlValue::text("Ada"),
        ];
        assert_eq!(handle.execute_for_row(&row).expect("executes"), 1);

        // slot beyond the row shape is a driver-boundary error
        let short = vec![SqlValue::I64(1)];
        assert!(handle.execute_for_row(&short).is_err());
    }
}
