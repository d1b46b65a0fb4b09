//! Conflict classifier: recognizing duplicate-key errors and mapping them
//! back to the violated constraint's columns.
//!
//! Error reporting is inconsistent across databases: some report a SQLSTATE,
//! some a vendor code, some bury the real cause several wrapping levels
//! deep, and the violated index name is only ever available as free text in
//! the message. The classifier absorbs all of that behind two questions:
//! "is this a duplicate-key conflict?" and "which columns are involved?"

use crate::catalog::IndexCatalog;
use crate::dialect::DialectProfile;
use crate::driver::{DbError, VENDOR_CODE_UNSET};

/// Result of resolving a duplicate-key error against the index catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolution {
    /// The constraint name that matched, if any. May be set even when the
    /// columns are unknown (the name matched but the catalog has no entry).
    pub matched_index: Option<String>,

    /// Columns of the violated constraint; empty when unresolved.
    pub columns: Vec<String>,
}

impl ConflictResolution {
    /// A resolution with no match.
    pub fn unresolved() -> Self {
        ConflictResolution {
            matched_index: None,
            columns: Vec::new(),
        }
    }

    /// Whether columns were resolved. Callers seeing `false` must treat the
    /// row as "conflict detected but columns unknown".
    pub fn is_resolved(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Determine the identifying code for an error under a profile's scheme.
///
/// SQLSTATE dialects use the outermost error's state code. Vendor-code
/// dialects walk the cause chain, skipping levels whose code is the unset
/// sentinel; if no level carries a non-zero code, the outermost error's own
/// code is used, even if zero.
pub fn identifying_code(profile: &DialectProfile, error: &DbError) -> String {
    if profile.uses_sql_state() {
        return error.sql_state().unwrap_or_default().to_string();
    }

    for level in error.chain() {
        if level.vendor_code() != VENDOR_CODE_UNSET {
            return level.vendor_code().to_string();
        }
    }
    error.vendor_code().to_string()
}

/// Is this error a duplicate-key conflict under the given profile?
pub fn is_duplicate_key(profile: &DialectProfile, error: &DbError) -> bool {
    if !profile.can_classify() {
        return false;
    }
    profile.is_duplicate_key_code(&identifying_code(profile, error))
}

/// Map a duplicate-key error to the violated constraint's columns.
///
/// Walks the cause chain (cycle-safe) applying the profile's index-name
/// pattern to each level's message until a name matches, then resolves the
/// name against the catalog, falling back to the primary key for the
/// dialect's primary-key marker.
pub fn resolve_conflict_columns(
    catalog: &IndexCatalog,
    profile: &DialectProfile,
    error: &DbError,
) -> ConflictResolution {
    for level in error.chain() {
        let Some(matched) = profile.extract_index_name(level.message()) else {
            continue;
        };
        return match catalog.resolve(&matched, profile.primary_key_marker()) {
            Some((name, columns)) => ConflictResolution {
                matched_index: Some(name),
                columns,
            },
            None => ConflictResolution {
                matched_index: Some(matched),
                columns: Vec::new(),
            },
        };
    }
    ConflictResolution::unresolved()
}

/// Indexed columns covered by neither the lookup keys nor the update
/// columns.
///
/// These are blind spots: a uniqueness violation can occur on a constraint
/// the caller never accounted for, so the worker warns about them up front.
pub fn columns_needing_extra_handling(
    catalog: &IndexCatalog,
    lookup_keys: &[String],
    update_columns: &[String],
) -> Vec<String> {
    let covered =
        |col: &str| -> bool { lookup_keys.iter().chain(update_columns).any(|c| c.eq_ignore_ascii_case(col)) };
    catalog
        .indexed_columns()
        .into_iter()
        .filter(|col| !covered(col))
        .collect()
}
