//! Translator settings.
//!
//! A [`TranslatorConfig`] is passed to every translation. Settings can be
//! built in code or loaded from JSON; missing keys take their defaults.

use serde::{Deserialize, Serialize};

use crate::error::TranslateError;

/// Default maximum depth of the scope tree.
pub const DEFAULT_MAX_SCOPE_DEPTH: usize = 32;

/// Default literal count above which an in-memory `Contains` list is bound
/// as a single array parameter.
pub const DEFAULT_MAX_IN_LIST_LITERALS: usize = 1000;

/// Settings that influence how a query pipeline is translated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Maximum nesting depth of SELECT scopes (correlated subqueries,
    /// derived tables and set-operation members all count).
    ///
    /// Translation fails with `NestingTooDeep` past this depth.
    pub max_scope_depth: usize,

    /// Maximum number of literals rendered inline for
    /// `collection.Contains(value)` over an in-memory list.
    ///
    /// Longer lists are registered as one external value and bound as an
    /// array parameter.
    pub max_in_list_literals: usize,

    /// Whether `Single`/`SingleOrDefault` fetch two rows (`LIMIT 2`) so the
    /// post-processor can detect a second row without reading the full set.
    pub single_row_probe: bool,

    /// Whether a raw grouping reaching the end of a pipeline is grouped on
    /// the host after retrieval.
    ///
    /// When disabled such pipelines fail with `InvalidProjectionShape`.
    pub host_grouping_fallback: bool,

    /// Prefix for generated table aliases (`t0`, `t1`, ...).
    pub table_alias_prefix: String,

    /// Whether each compiled query's reference SQL rendering is emitted at
    /// DEBUG level.
    pub log_sql: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            max_scope_depth: DEFAULT_MAX_SCOPE_DEPTH,
            max_in_list_literals: DEFAULT_MAX_IN_LIST_LITERALS,
            single_row_probe: true,
            host_grouping_fallback: true,
            table_alias_prefix: "t".to_string(),
            log_sql: false,
        }
    }
}

impl TranslatorConfig {
    /// Parse settings from a JSON document and validate them.
    pub fn from_json(json: &str) -> Result<Self, TranslateError> {
        let config: TranslatorConfig = serde_json::from_str(json)
            .map_err(|e| TranslateError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), TranslateError> {
        if self.max_scope_depth == 0 {
            return Err(TranslateError::InvalidConfig(
                "max_scope_depth must be at least 1".into(),
            ));
        }
        let mut chars = self.table_alias_prefix.chars();
        let valid_prefix = match chars.next() {
            Some(first) => {
                first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if !valid_prefix {
            return Err(TranslateError::InvalidConfig(format!(
                "table_alias_prefix must be an identifier, got '{}'",
                self.table_alias_prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TranslatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_scope_depth, 32);
        assert_eq!(config.max_in_list_literals, 1000);
        assert!(config.single_row_probe);
        assert!(config.host_grouping_fallback);
        assert_eq!(config.table_alias_prefix, "t");
    }

    #[test]
    fn test_from_json_partial_uses_defaults() {
        let config = TranslatorConfig::from_json(r#"{"max_in_list_literals": 5}"#).unwrap();
        assert_eq!(config.max_in_list_literals, 5);
        assert_eq!(config.max_scope_depth, DEFAULT_MAX_SCOPE_DEPTH);
        assert!(!config.log_sql);
    }

    #[test]
    fn test_from_json_rejects_zero_depth() {
        let err = TranslatorConfig::from_json(r#"{"max_scope_depth": 0}"#).unwrap_err();
        assert!(matches!(err, TranslateError::InvalidConfig(_)));
    }

    #[test]
    fn test_alias_prefix_must_be_identifier() {
        for bad in ["", "1t", "t-x", "a b"] {
            let config = TranslatorConfig {
                table_alias_prefix: bad.to_string(),
                ..TranslatorConfig::default()
            };
            assert!(config.validate().is_err(), "prefix {bad:?} accepted");
        }
        let config = TranslatorConfig {
            table_alias_prefix: "tbl_".to_string(),
            ..TranslatorConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_malformed() {
        assert!(matches!(
            TranslatorConfig::from_json("{not json"),
            Err(TranslateError::InvalidConfig(_))
        ));
    }
}
