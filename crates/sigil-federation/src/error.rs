//! Federation-specific error types.

use sigil_common::SigilError;
use thiserror::Error;

/// Errors that can occur in federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Key management ──────────────────────────────────────────────────────

    #[error("No signing key found for key ID '{0}'")]
    KeyNotFound(String),

    #[error("Failed to load signing key: {0}")]
    KeyLoad(String),

    #[error("Refusing to prune '{0}': it is the current signing key")]
    CurrentKeyInUse(String),

    // ── Signature verification ───────────────────────────────────────────────

    #[error("Malformed Authorization header: {0}")]
    MalformedAuthHeader(String),

    #[error("No signature from '{0}' on signed object")]
    MissingSignature(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    // ── Discovery ───────────────────────────────────────────────────────────

    #[error("Failed to resolve server '{0}': {1}")]
    DiscoveryFailed(String, String),

    // ── Remote communication ─────────────────────────────────────────────────

    #[error("HTTP error communicating with remote server '{0}': {1}")]
    RemoteHttp(String, String),

    #[error("Remote server '{0}' returned an unexpected response: {1}")]
    RemoteProtocol(String, String),

    // ── General ─────────────────────────────────────────────────────────────

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error(transparent)]
    Storage(#[from] SigilError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FederationError {
    /// Failures that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryFailed(..) | Self::RemoteHttp(..) | Self::RemoteProtocol(..)
        ) || matches!(self, Self::Storage(e) if e.is_transient())
    }
}

impl From<reqwest::Error> for FederationError {
    fn from(e: reqwest::Error) -> Self {
        let server = e.url().map(|u| u.host_str().unwrap_or("?").to_owned()).unwrap_or_default();
        FederationError::RemoteHttp(server, e.to_string())
    }
}

impl From<FederationError> for SigilError {
    fn from(e: FederationError) -> Self {
        match e {
            FederationError::Storage(inner) => inner,
            e if e.is_transient() => SigilError::TransientIo(e.to_string()),
            FederationError::Other(inner) => SigilError::Internal(inner),
            e => SigilError::Signing(e.to_string()),
        }
    }
}
