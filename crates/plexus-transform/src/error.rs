use crate::dialect::Dialect;

/// Malformed input. Carries the dialect, the offending field, and a
/// human-readable reason; producing one has no side effects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{dialect} parse error at `{field}`: {reason}")]
pub struct ParseError {
    pub dialect: Dialect,
    pub field: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(dialect: Dialect, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            dialect,
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a serde error for a whole-document parse.
    pub fn invalid_json(dialect: Dialect, err: serde_json::Error) -> Self {
        Self::new(dialect, "$", err.to_string())
    }
}
