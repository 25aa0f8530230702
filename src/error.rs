//! Error types for the query translator.
//!
//! All errors that can occur while translating a query pipeline or
//! materializing its rows are represented by [`TranslateError`]. Errors are
//! propagated via `Result<T, TranslateError>` throughout the crate; nothing
//! panics on malformed input and no partial translation is ever returned.
//!
//! # Error Classification
//!
//! Errors are classified into three categories:
//! - **Translation** — the pipeline uses an operator, overload, member or
//!   shape the translator cannot express in SQL. Deterministic for a given
//!   expression, so a caller may cache the failure.
//! - **Materialization** — returned rows violate a cardinality contract, a
//!   column value cannot be converted to its host type, or a runtime value
//!   cannot be bound to its parameter.
//! - **Internal** — bugs.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    // ── Translation errors ───────────────────────────────────────────────
    /// A method, operator or overload that has no translation.
    #[error("unsupported operator {operator} at chain position {position}: {expression}")]
    UnsupportedOperator {
        operator: String,
        position: usize,
        expression: String,
    },

    /// A join whose outer side does not resolve to a table of the current scope.
    #[error("ambiguous join source in {operator}: {expression}")]
    AmbiguousJoinSource { operator: String, expression: String },

    /// A projection or key selector produced a shape SQL cannot carry.
    #[error("invalid projection shape in {operator}: {reason} ({expression})")]
    InvalidProjectionShape {
        operator: String,
        reason: String,
        expression: String,
    },

    /// A member that the catalog does not know.
    #[error("unknown member {member} on {owner}")]
    UnknownMember { owner: String, member: String },

    /// A lambda parameter referenced outside of any binding frame.
    #[error("unbound lambda parameter: {0}")]
    UnboundParameter(String),

    /// The scope tree grew deeper than the configured maximum.
    #[error("query nesting exceeds the maximum depth of {0} scopes")]
    NestingTooDeep(usize),

    /// The translator configuration failed validation.
    #[error("invalid translator configuration: {0}")]
    InvalidConfig(String),

    // ── Materialization errors ───────────────────────────────────────────
    /// First/Single/Last found the wrong number of rows.
    #[error("{operator}: {message}")]
    CardinalityViolation { operator: String, message: String },

    /// A column value could not be converted to its host type.
    #[error("conversion failed at row {row}, column {column}: {message}")]
    Conversion {
        row: usize,
        column: String,
        message: String,
    },

    /// A runtime value could not be prepared for its SQL parameter.
    #[error("cannot bind parameter {parameter}: {message}")]
    ParameterBinding { parameter: String, message: String },

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl TranslateError {
    /// Build an [`TranslateError::UnsupportedOperator`].
    pub fn unsupported(
        operator: impl Into<String>,
        position: usize,
        expression: impl Into<String>,
    ) -> Self {
        TranslateError::UnsupportedOperator {
            operator: operator.into(),
            position,
            expression: expression.into(),
        }
    }

    /// Build an [`TranslateError::InvalidProjectionShape`].
    pub fn invalid_shape(
        operator: impl Into<String>,
        reason: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        TranslateError::InvalidProjectionShape {
            operator: operator.into(),
            reason: reason.into(),
            expression: expression.into(),
        }
    }

    /// Whether the failure is a property of the query expression alone.
    ///
    /// Translation errors are deterministic: translating the same
    /// expression again yields the same error.
    pub fn is_deterministic(&self) -> bool {
        self.kind() == ErrorKind::Translation
    }

    /// Whether the error was raised while reading result rows.
    pub fn is_materialization_error(&self) -> bool {
        self.kind() == ErrorKind::Materialization
    }
}

/// Classification of error kind for logging and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Translation,
    Materialization,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Translation => write!(f, "TRANSLATION"),
            ErrorKind::Materialization => write!(f, "MATERIALIZATION"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl TranslateError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslateError::UnsupportedOperator { .. }
            | TranslateError::AmbiguousJoinSource { .. }
            | TranslateError::InvalidProjectionShape { .. }
            | TranslateError::UnknownMember { .. }
            | TranslateError::UnboundParameter(_)
            | TranslateError::NestingTooDeep(_)
            | TranslateError::InvalidConfig(_) => ErrorKind::Translation,

            TranslateError::CardinalityViolation { .. }
            | TranslateError::Conversion { .. }
            | TranslateError::ParameterBinding { .. } => ErrorKind::Materialization,

            TranslateError::InternalError(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            TranslateError::unsupported("Aggregate", 2, "src.Aggregate(...)").kind(),
            ErrorKind::Translation
        );
        assert_eq!(
            TranslateError::UnboundParameter("y".into()).kind(),
            ErrorKind::Translation
        );
        assert_eq!(
            TranslateError::NestingTooDeep(4).kind(),
            ErrorKind::Translation
        );
        assert_eq!(
            TranslateError::CardinalityViolation {
                operator: "Single".into(),
                message: "sequence contains more than one element".into(),
            }
            .kind(),
            ErrorKind::Materialization
        );
        assert_eq!(
            TranslateError::Conversion {
                row: 3,
                column: "c0".into(),
                message: "bad".into(),
            }
            .kind(),
            ErrorKind::Materialization
        );
        assert_eq!(
            TranslateError::InternalError("bug".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_deterministic_errors() {
        assert!(TranslateError::invalid_shape("Select", "nested sequence", "x => x.Items").is_deterministic());
        assert!(!TranslateError::InternalError("x".into()).is_deterministic());
        assert!(
            TranslateError::Conversion {
                row: 0,
                column: "c1".into(),
                message: "x".into()
            }
            .is_materialization_error()
        );
    }

    #[test]
    fn test_error_messages_name_operator_and_position() {
        let err = TranslateError::unsupported("Zip", 3, "src.Zip(other)");
        let msg = err.to_string();
        assert!(msg.contains("Zip"));
        assert!(msg.contains("position 3"));
        assert!(msg.contains("src.Zip(other)"));

        let err = TranslateError::Conversion {
            row: 7,
            column: "c2".into(),
            message: "value out of range".into(),
        };
        assert_eq!(
            err.to_string(),
            "conversion failed at row 7, column c2: value out of range"
        );
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Translation.to_string(), "TRANSLATION");
        assert_eq!(ErrorKind::Materialization.to_string(), "MATERIALIZATION");
        assert_eq!(ErrorKind::Internal.to_string(), "INTERNAL");
    }
}
