//! Dialect registry: explicit, injected lookup of compiled profiles.
//!
//! The registry is explicitly constructed and passed into workers rather
//! than living behind a global. Profiles are compiled lazily on first
//! resolve and cached by normalized type name; an unrecognized database
//! type degrades to a fallback profile that cannot classify conflicts,
//! it never fails the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::error::{Result, UpsertError};

use super::{builtin_specs, fallback_spec, DialectProfile, ProfileSpec};

/// Registry of dialect profile specs with a lazy compile cache.
#[derive(Default)]
pub struct DialectRegistry {
    specs: HashMap<String, ProfileSpec>,
    cache: Mutex<HashMap<String, Arc<DialectProfile>>>,
}

impl DialectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in dialect table registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, spec) in builtin_specs() {
            registry.register_spec(name, spec);
        }
        registry
    }

    /// Register (or replace) a spec for a database-type identifier.
    pub fn register_spec(&mut self, name: impl Into<String>, spec: ProfileSpec) {
        let key = name.into().to_ascii_lowercase();
        self.specs.insert(key, spec);
        // A replaced spec must not keep serving a stale compiled profile.
        self.lock_cache().clear();
    }

    /// Merge additional dialect rows from a JSON object mapping type name
    /// to spec.
    pub fn merge_json(&mut self, json: &str) -> Result<()> {
        let rows: HashMap<String, ProfileSpec> = serde_json::from_str(json)
            .map_err(|e| UpsertError::config(format!("invalid dialect table JSON: {}", e)))?;
        for (name, spec) in rows {
            self.register_spec(name, spec);
        }
        Ok(())
    }

    /// Check if a spec is registered for a type (after alias normalization).
    pub fn has_dialect(&self, db_type: &str) -> bool {
        self.specs.contains_key(&self.lookup_key(db_type))
    }

    /// Registered type identifiers.
    pub fn dialect_names(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }

    /// Normalize common aliases to the canonical type identifier:
    /// "sqlserver" → "mssql", "pg" → "postgres", "mariadb" → "mysql", etc.
    pub fn normalize_db_type(db_type: &str) -> Option<&'static str> {
        match db_type.to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" | "sql_server" => Some("mssql"),
            "postgres" | "postgresql" | "pg" => Some("postgres"),
            "mysql" | "mariadb" => Some("mysql"),
            "oracle" | "ora" => Some("oracle"),
            "sqlite" | "sqlite3" => Some("sqlite"),
            _ => None,
        }
    }

    /// Resolve the compiled profile for a database-type identifier.
    ///
    /// An exact registered spec (e.g. a caller-registered "mariadb" row)
    /// takes precedence over alias normalization. Unknown types resolve to
    /// the fallback profile with a warning; the only failure mode is a spec
    /// whose pattern does not compile.
    pub fn resolve(&self, db_type: &str) -> Result<Arc<DialectProfile>> {
        let key = self.lookup_key(db_type);

        let mut cache = self.lock_cache();
        if let Some(profile) = cache.get(&key) {
            return Ok(profile.clone());
        }

        let profile = match self.specs.get(&key) {
            Some(spec) => DialectProfile::compile(&key, spec)?,
            None => {
                warn!(
                    db_type = %db_type,
                    "no dialect profile registered; duplicate-key conflicts will not be classified"
                );
                DialectProfile::compile(&key, &fallback_spec())?
            }
        };

        let profile = Arc::new(profile);
        cache.insert(key, profile.clone());
        Ok(profile)
    }

    fn lookup_key(&self, db_type: &str) -> String {
        let raw = db_type.trim().to_ascii_lowercase();
        if self.specs.contains_key(&raw) {
            return raw;
        }
        match Self::normalize_db_type(&raw) {
            Some(canonical) => canonical.to_string(),
            None => raw,
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DialectProfile>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DialectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialectRegistry")
            .field("specs", &self.specs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve() {
        let registry = DialectRegistry::with_builtins();
        for name in ["mysql", "postgres", "mssql", "oracle", "sqlite"] {
            let profile = registry.resolve(name).expect("resolves");
            assert_eq!(profile.name(), name);
            assert!(profile.can_classify());
        }
    }

    #[test]
    fn test_alias_normalization() {
        let registry = DialectRegistry::with_builtins();
        let a = registry.resolve("MariaDB").expect("resolves");
        let b = registry.resolve("mysql").expect("resolves");
        assert!(Arc::ptr_eq(&a, &b));

        let pg = registry.resolve("pg").expect("resolves");
        assert_eq!(pg.name(), "postgres");
        assert!(pg.uses_sql_state());
    }

    #[test]
    fn test_resolve_caches_profile() {
        let registry = DialectRegistry::with_builtins();
        let first = registry.resolve("mysql").expect("resolves");
        let second = registry.resolve("mysql").expect("resolves");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_type_degrades_to_fallback() {
        let registry = DialectRegistry::with_builtins();
        let profile = registry.resolve("duckdb").expect("falls back");
        assert_eq!(profile.name(), "duckdb");
        assert!(!profile.can_classify());
        assert!(!profile.uses_sql_state());
    }

    #[test]
    fn test_registered_alias_takes_precedence() {
        let mut registry = DialectRegistry::with_builtins();
        let mut spec = fallback_spec();
        spec.duplicate_key_codes = vec!["1062".to_string()];
        registry.register_spec("mariadb", spec);

        let profile = registry.resolve("mariadb").expect("resolves");
        assert_eq!(profile.name(), "mariadb");
        assert!(!profile.reports_per_row_outcome());
    }

    #[test]
    fn test_merge_json_adds_dialect() {
        let mut registry = DialectRegistry::with_builtins();
        registry
            .merge_json(
                r#"{
                    "h2": {
                        "uses_sql_state": false,
                        "reports_per_row_outcome": true,
                        "duplicate_key_codes": ["23505"],
                        "index_name_pattern": "violation: \"(?P<index>[^\"]+)\""
                    }
                }"#,
            )
            .expect("merges");
        assert!(registry.has_dialect("h2"));
        let profile = registry.resolve("h2").expect("resolves");
        assert!(profile.can_classify());
    }

    #[test]
    fn test_merge_json_rejects_garbage() {
        let mut registry = DialectRegistry::new();
        assert!(registry.merge_json("not json").is_err());
    }
}
