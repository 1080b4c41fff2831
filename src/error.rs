//! Error types for mne-memory

use thiserror::Error;

/// Result type alias for mne-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mne-memory
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: dimension mismatch, bad id, out-of-range parameter
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reference to a missing or evicted node or edge
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding unavailable during {operation}: {reason}")]
    EmbeddingUnavailable { operation: String, reason: String },

    #[error("Persistence unavailable during {operation}: {reason}")]
    PersistenceUnavailable { operation: String, reason: String },

    #[error("Similarity index error during {operation}: {reason}")]
    Index { operation: String, reason: String },

    /// Another sweep is already running on this store
    #[error("A decay sweep is already in progress")]
    SweepInProgress,

    /// A broken internal invariant; the operation was aborted without mutation
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn embedding(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::EmbeddingUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::PersistenceUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn index(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Index {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failure came from an external collaborator rather than the core.
    ///
    /// Callers use this to decide whether a retry policy applies.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. } | Self::PersistenceUnavailable { .. } | Self::Index { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_errors_are_flagged() {
        assert!(Error::embedding("create", "model offline").is_external());
        assert!(Error::persistence("flush", "disk full").is_external());
        assert!(!Error::validation("bad dimension").is_external());
        assert!(!Error::SweepInProgress.is_external());
    }

    #[test]
    fn messages_carry_operation_context() {
        let err = Error::persistence("apply", "database is locked");
        let msg = err.to_string();
        assert!(msg.contains("apply"));
        assert!(msg.contains("database is locked"));
    }
}
