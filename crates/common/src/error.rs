//! Error types for the session and transaction core

use thiserror::Error;

/// Errors raised by the session core and its collaborators
///
/// Cloneable so a single failure can be delivered both to the registered
/// async handler and to a scheduler-level listener.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// The session was used after close
    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    /// A table with the same name already exists
    #[error("table or view already exists: {0}")]
    TableOrViewAlreadyExists(String),

    /// An index with the same name already exists
    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    /// A constraint with the same name already exists
    #[error("constraint already exists: {0}")]
    ConstraintAlreadyExists(String),

    /// Commit/rollback was attempted while disabled and locks are held
    #[error("commit or rollback is not allowed here")]
    CommitRollbackNotAllowed,

    /// The statement was canceled or its query timeout elapsed
    #[error("statement was canceled")]
    StatementCanceled,

    /// A lock wait exceeded the session's lock timeout
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// User-class policy violation
    #[error("access denied to class: {0}")]
    AccessDeniedToClass(String),

    /// User-class lookup failure
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// LOB or variable decoding failed
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    /// LOB or variable encoding failed
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// An unknown setting value, isolation level, or similar
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    /// SQL text could not be parsed
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A state invariant was violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Invalid-value convenience constructor
    pub fn invalid_value(name: &str, value: impl Into<String>) -> Self {
        DbError::InvalidValue {
            name: name.to_string(),
            value: value.into(),
        }
    }

    /// Whether this error is the cancellation signal
    pub fn is_canceled(&self) -> bool {
        matches!(self, DbError::StatementCanceled)
    }
}

/// Result type alias used across the workspace
pub type Result<T> = std::result::Result<T, DbError>;
