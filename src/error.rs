//! Error types for the advisory orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Turn Pipeline Errors
    // =============================

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Routing error: {0}")]
    RoutingError(String),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Version conflict on thread {thread_id}: expected {expected}, found {found}")]
    VersionConflict {
        thread_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Storage failures end the turn; everything else has a recovery path.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::StorageError(_) | Self::VersionConflict { .. } | Self::DatabaseError(_)
        )
    }
}
