//! Dialect profiles: per-database-type error-reporting conventions.
//!
//! A [`ProfileSpec`] is a pure data row of the dialect configuration table —
//! it says whether a database identifies errors by SQLSTATE or vendor code,
//! which codes mean "duplicate key", whether batch execution reports per-row
//! outcomes, and which regex pulls a constraint name out of an error message.
//! Adding dialect support means adding a row, not touching engine logic.
//!
//! A [`DialectProfile`] is the compiled, immutable form used by the
//! classifier. Profiles are built lazily and cached by the
//! [`DialectRegistry`](registry::DialectRegistry).

mod registry;

pub use registry::DialectRegistry;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpsertError};

/// Named capture group the index-name pattern must define.
pub const INDEX_CAPTURE_GROUP: &str = "index";

/// Fallback pattern used for unrecognized database types: matches the common
/// `... key 'name'` / `... constraint 'name'` phrasing.
pub const DEFAULT_INDEX_NAME_PATTERN: &str = r"(?i)(?:key|index|constraint)\s+'(?P<index>[^']+)'";

/// Identifier quoting convention for generated SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStyle {
    /// ANSI double quotes: `"name"`.
    DoubleQuote,
    /// MySQL backticks: `` `name` ``.
    Backtick,
    /// SQL Server brackets: `[name]`.
    Bracket,
}

impl Default for QuoteStyle {
    fn default() -> Self {
        QuoteStyle::DoubleQuote
    }
}

impl QuoteStyle {
    /// Quote an identifier, doubling any embedded closing delimiter.
    pub fn quote(&self, name: &str) -> String {
        match self {
            QuoteStyle::DoubleQuote => format!("\"{}\"", name.replace('"', "\"\"")),
            QuoteStyle::Backtick => format!("`{}`", name.replace('`', "``")),
            QuoteStyle::Bracket => format!("[{}]", name.replace(']', "]]")),
        }
    }
}

/// One row of the dialect configuration table.
///
/// This is data, not behavior: rows can be registered in code or merged from
/// JSON without changing the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Identify errors by SQLSTATE instead of vendor code.
    pub uses_sql_state: bool,

    /// Whether batch execution reports a per-row outcome, or may collapse to
    /// a single "success, count unknown" marker.
    pub reports_per_row_outcome: bool,

    /// Codes that mean "duplicate key" for this database.
    pub duplicate_key_codes: Vec<String>,

    /// Regex with an `index` named capture pulling the violated constraint
    /// name out of an error message.
    pub index_name_pattern: String,

    /// The literal constraint name some databases report for primary-key
    /// violations.
    #[serde(default = "default_primary_key_marker")]
    pub primary_key_marker: String,

    /// Identifier quoting convention.
    #[serde(default)]
    pub quote_style: QuoteStyle,
}

fn default_primary_key_marker() -> String {
    "PRIMARY".to_string()
}

/// Spec used for database types with no registered profile: no codes (so
/// conflicts cannot be classified), generic index pattern.
pub(crate) fn fallback_spec() -> ProfileSpec {
    ProfileSpec {
        uses_sql_state: false,
        reports_per_row_outcome: false,
        duplicate_key_codes: vec![],
        index_name_pattern: DEFAULT_INDEX_NAME_PATTERN.to_string(),
        primary_key_marker: default_primary_key_marker(),
        quote_style: QuoteStyle::default(),
    }
}

/// Built-in dialect table.
pub(crate) fn builtin_specs() -> Vec<(&'static str, ProfileSpec)> {
    vec![
        (
            "mysql",
            ProfileSpec {
                uses_sql_state: false,
                reports_per_row_outcome: true,
                duplicate_key_codes: ["1022", "1062", "1557", "1569", "1586"]
                    .map(String::from)
                    .to_vec(),
                // "Duplicate entry 'x' for key 'uq_email'"; MySQL 8 prefixes
                // the table name: "for key 't.uq_email'".
                index_name_pattern: r"for key '(?:[^'.]+\.)?(?P<index>[^']+)'".to_string(),
                primary_key_marker: "PRIMARY".to_string(),
                quote_style: QuoteStyle::Backtick,
            },
        ),
        (
            "postgres",
            ProfileSpec {
                uses_sql_state: true,
                reports_per_row_outcome: false,
                duplicate_key_codes: vec!["23505".to_string()],
                // duplicate key value violates unique constraint "uq_email"
                index_name_pattern: r#"unique constraint "(?P<index>[^"]+)""#.to_string(),
                primary_key_marker: "PRIMARY".to_string(),
                quote_style: QuoteStyle::DoubleQuote,
            },
        ),
        (
            "mssql",
            ProfileSpec {
                uses_sql_state: false,
                reports_per_row_outcome: false,
                duplicate_key_codes: ["2601", "2627"].map(String::from).to_vec(),
                // "Violation of UNIQUE KEY constraint 'UQ_x'" and
                // "Cannot insert duplicate key row ... with unique index 'ix_y'"
                index_name_pattern: r"(?i)(?:constraint|index) '(?P<index>[^']+)'".to_string(),
                primary_key_marker: "PRIMARY".to_string(),
                quote_style: QuoteStyle::Bracket,
            },
        ),
        (
            "oracle",
            ProfileSpec {
                uses_sql_state: false,
                reports_per_row_outcome: false,
                duplicate_key_codes: vec!["1".to_string()],
                // ORA-00001: unique constraint (SCHEMA.UQ_EMAIL) violated
                index_name_pattern:
                    r"(?i)unique constraint \((?:[A-Za-z0-9_$#]+\.)?(?P<index>[^)]+)\) violated"
                        .to_string(),
                primary_key_marker: "PRIMARY".to_string(),
                quote_style: QuoteStyle::DoubleQuote,
            },
        ),
        (
            "sqlite",
            ProfileSpec {
                uses_sql_state: false,
                reports_per_row_outcome: true,
                duplicate_key_codes: ["19", "1555", "2067"].map(String::from).to_vec(),
                // SQLite reports the column list, not an index name:
                // "UNIQUE constraint failed: users.email"
                index_name_pattern: r"(?i)unique constraint failed: (?P<index>\S+)".to_string(),
                primary_key_marker: "PRIMARY".to_string(),
                quote_style: QuoteStyle::DoubleQuote,
            },
        ),
    ]
}

/// Compiled, immutable error-reporting profile for one database type.
#[derive(Debug, Clone)]
pub struct DialectProfile {
    name: String,
    uses_sql_state: bool,
    reports_per_row_outcome: bool,
    duplicate_key_codes: Vec<String>,
    index_name_pattern: Regex,
    primary_key_marker: String,
    quote_style: QuoteStyle,
}

impl DialectProfile {
    /// Compile a spec into a profile.
    ///
    /// Sorts and dedups the code set (classification binary-searches it) and
    /// validates that the pattern compiles and carries the `index` capture.
    pub fn compile(name: &str, spec: &ProfileSpec) -> Result<Self> {
        let pattern = Regex::new(&spec.index_name_pattern).map_err(|e| {
            UpsertError::config(format!(
                "dialect '{}': invalid index name pattern: {}",
                name, e
            ))
        })?;

        if !pattern
            .capture_names()
            .flatten()
            .any(|n| n == INDEX_CAPTURE_GROUP)
        {
            return Err(UpsertError::config(format!(
                "dialect '{}': index name pattern is missing the '{}' capture group",
                name, INDEX_CAPTURE_GROUP
            )));
        }

        let mut codes = spec.duplicate_key_codes.clone();
        codes.sort();
        codes.dedup();

        Ok(DialectProfile {
            name: name.to_string(),
            uses_sql_state: spec.uses_sql_state,
            reports_per_row_outcome: spec.reports_per_row_outcome,
            duplicate_key_codes: codes,
            index_name_pattern: pattern,
            primary_key_marker: spec.primary_key_marker.clone(),
            quote_style: spec.quote_style,
        })
    }

    /// The dialect identifier this profile was compiled for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether errors are identified by SQLSTATE rather than vendor code.
    pub fn uses_sql_state(&self) -> bool {
        self.uses_sql_state
    }

    /// Whether batch execution reports per-row outcomes.
    pub fn reports_per_row_outcome(&self) -> bool {
        self.reports_per_row_outcome
    }

    /// The literal name this dialect reports for primary-key violations.
    pub fn primary_key_marker(&self) -> &str {
        &self.primary_key_marker
    }

    /// Identifier quoting convention.
    pub fn quote_style(&self) -> QuoteStyle {
        self.quote_style
    }

    /// Quote an identifier in this dialect's convention.
    pub fn quote_ident(&self, name: &str) -> String {
        self.quote_style.quote(name)
    }

    /// Whether this profile can classify duplicate-key conflicts at all.
    /// False for the fallback profile of unrecognized database types.
    pub fn can_classify(&self) -> bool {
        !self.duplicate_key_codes.is_empty()
    }

    /// Check an identifying code against the duplicate-key code set.
    pub fn is_duplicate_key_code(&self, code: &str) -> bool {
        self.duplicate_key_codes
            .binary_search_by(|probe| probe.as_str().cmp(code))
            .is_ok()
    }

    /// Apply the index-name pattern to a message, returning the captured
    /// constraint name.
    pub fn extract_index_name(&self, message: &str) -> Option<String> {
        self.index_name_pattern
            .captures(message.trim())
            .and_then(|caps| caps.name(INDEX_CAPTURE_GROUP))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_builtin(name: &str) -> DialectProfile {
        let spec = builtin_specs()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| s)
            .expect("builtin spec");
        DialectProfile::compile(name, &spec).expect("compiles")
    }

    #[test]
    fn test_compile_rejects_missing_capture_group() {
        let mut spec = fallback_spec();
        spec.index_name_pattern = r"for key '([^']+)'".to_string();
        let err = DialectProfile::compile("broken", &spec).unwrap_err();
        assert!(matches!(err, UpsertError::Config(_)));
    }

    #[test]
    fn test_compile_rejects_invalid_regex() {
        let mut spec = fallback_spec();
        spec.index_name_pattern = r"(?P<index>[unclosed".to_string();
        assert!(DialectProfile::compile("broken", &spec).is_err());
    }

    #[test]
    fn test_codes_sorted_for_binary_search() {
        let mut spec = fallback_spec();
        spec.duplicate_key_codes = vec!["2627".into(), "1062".into(), "2601".into()];
        let profile = DialectProfile::compile("x", &spec).expect("compiles");
        assert!(profile.is_duplicate_key_code("1062"));
        assert!(profile.is_duplicate_key_code("2601"));
        assert!(profile.is_duplicate_key_code("2627"));
        assert!(!profile.is_duplicate_key_code("1063"));
    }

    #[test]
    fn test_mysql_key_extraction() {
        let profile = compile_builtin("mysql");
        assert_eq!(
            profile.extract_index_name("Duplicate entry 'x' for key 'uq_email'"),
            Some("uq_email".to_string())
        );
        // MySQL 8 table-prefixed form
        assert_eq!(
            profile.extract_index_name("Duplicate entry 'x' for key 'users.uq_email'"),
            Some("uq_email".to_string())
        );
    }

    #[test]
    fn test_postgres_constraint_extraction() {
        let profile = compile_builtin("postgres");
        assert_eq!(
            profile.extract_index_name(
                r#"ERROR: duplicate key value violates unique constraint "uq_email""#
            ),
            Some("uq_email".to_string())
        );
    }

    #[test]
    fn test_oracle_constraint_extraction_strips_schema() {
        let profile = compile_builtin("oracle");
        assert_eq!(
            profile.extract_index_name("ORA-00001: unique constraint (APP.UQ_EMAIL) violated"),
            Some("UQ_EMAIL".to_string())
        );
    }

    #[test]
    fn test_mssql_index_extraction() {
        let profile = compile_builtin("mssql");
        assert_eq!(
            profile.extract_index_name(
                "Cannot insert duplicate key row in object 'dbo.t' with unique index 'ix_y'."
            ),
            Some("ix_y".to_string())
        );
    }

    #[test]
    fn test_quote_styles() {
        assert_eq!(QuoteStyle::DoubleQuote.quote("na\"me"), "\"na\"\"me\"");
        assert_eq!(QuoteStyle::Backtick.quote("na`me"), "`na``me`");
        assert_eq!(QuoteStyle::Bracket.quote("na]me"), "[na]]me]");
    }

    #[test]
    fn test_spec_roundtrips_through_json() {
        let json = r#"{
            "uses_sql_state": true,
            "reports_per_row_outcome": false,
            "duplicate_key_codes": ["23505"],
            "index_name_pattern": "constraint \"(?P<index>[^\"]+)\""
        }"#;
        let spec: ProfileSpec = serde_json::from_str(json).expect("parses");
        assert_eq!(spec.primary_key_marker, "PRIMARY");
        assert_eq!(spec.quote_style, QuoteStyle::DoubleQuote);
        assert!(DialectProfile::compile("custom", &spec).is_ok());
    }
}
