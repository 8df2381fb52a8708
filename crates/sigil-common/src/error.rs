//! Centralized error types for Sigil.
//!
//! The variants follow the service's failure taxonomy: caller contract
//! violations, authorization denials, transient network failures, and
//! storage failures. Advisory paths (invite delivery, replication) log and
//! retry instead of returning these to the original caller.

/// Core error type returned by the binder and the stores.
#[derive(Debug, thiserror::Error)]
pub enum SigilError {
    // === Caller contract ===
    #[error("Precondition violated: {message}")]
    ValidationPrecondition { message: String },

    #[error("Invalid identifier: {message}")]
    InvalidIdentifier { message: String },

    // === Authorization ===
    #[error("Signature does not prove ownership of {account_id}")]
    AuthorizationFailure { account_id: String },

    // === Infrastructure errors ===
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Storage failure: {0}")]
    Durability(#[from] sqlx::Error),

    #[error("Signing failure: {0}")]
    Signing(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SigilError {
    /// Matrix-style error code for the HTTP layer sitting in front of the core.
    pub fn error_code(&self) -> &str {
        match self {
            Self::ValidationPrecondition { .. } => "M_SESSION_NOT_VALIDATED",
            Self::InvalidIdentifier { .. } => "M_INVALID_PARAM",
            Self::AuthorizationFailure { .. } => "M_FORBIDDEN",
            Self::TransientIo(_) => "M_UNAVAILABLE",
            Self::Durability(_) | Self::Signing(_) | Self::Internal(_) => "M_UNKNOWN",
        }
    }

    /// Whether the failure is worth retrying later without caller changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        Self::InvalidIdentifier { message: message.into() }
    }
}

/// Convenience type alias for Results using SigilError.
pub type SigilResult<T> = Result<T, SigilError>;
