//! Error taxonomy shared by every registry operation.

use thiserror::Error;

/// Errors surfaced by the registry core.
///
/// `Degraded` is recovered locally by the dispatcher (it falls through to the
/// next tier); every other variant reaches the caller unchanged.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A named entity does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// Role/action mismatch, system-capability immunity, or disabled governance.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Missing, too long or out-of-range input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A name that must be unique is already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Embedding or generation provider unavailable or errored.
    #[error("Dependency unavailable: {0}")]
    Degraded(String),

    /// The store failed mid-operation.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl RegistryError {
    pub fn not_found(kind: impl Into<String>, name: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.to_string(),
        }
    }

    /// Stable machine-readable code used in structured error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::Degraded(_) => "degraded_dependency",
            Self::Persistence(_) => "persistence_error",
        }
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {}", e))
    }
}

impl From<tokio::task::JoinError> for RegistryError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Persistence(format!("store task failed: {}", e))
    }
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = RegistryError::not_found("agent", "code-reviewer");
        assert_eq!(err.to_string(), "agent not found: code-reviewer");
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_sqlite_errors_become_persistence() {
        let err: RegistryError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, RegistryError::Persistence(_)));
    }
}
