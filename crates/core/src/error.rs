//! Domain error model.

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, business rules). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict detected by the domain itself (e.g. "already exists").
    #[error("conflict: {0}")]
    Conflict(String),

    /// A business rule violation that downstream handlers may react to.
    ///
    /// The engine publishes this as an exception to every handler registered
    /// for `exception_type`; `payload` carries whatever those handlers need.
    #[error("business rule `{exception_type}` violated: {message}")]
    BusinessRule {
        exception_type: String,
        message: String,
        payload: JsonValue,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn business_rule(
        exception_type: impl Into<String>,
        message: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self::BusinessRule {
            exception_type: exception_type.into(),
            message: message.into(),
            payload,
        }
    }

    /// Whether this error should be published to exception handlers.
    pub fn is_publishable(&self) -> bool {
        matches!(self, Self::BusinessRule { .. })
    }
}
