//! Error taxonomy shared by the poller and the remote key fetcher.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The credential source failed (non-zero exit, spawn error, timeout).
    /// The poller recovers from this locally; it never ends the loop.
    #[error("credential source failed: {0}")]
    CredentialSource(String),

    /// A snapshot was requested before the first successful fetch.
    #[error("no credential available yet")]
    NoCredentialYet,

    /// Transport-level failure talking to the remote key endpoint.
    #[error("failed to fetch key for {provider}: {cause}")]
    KeyFetch {
        provider: String,
        status: Option<u16>,
        cause: String,
    },

    /// The endpoint answered 2xx but carried neither `token` nor `api_key`.
    #[error("invalid key response for {provider}: endpoint returned neither a token nor an api_key field. Response: {body}")]
    InvalidKeyResponse { provider: String, body: String },

    /// Invalid client configuration (header values, TLS setup).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Upstream HTTP status, when the failure came with one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::KeyFetch { status, .. } => *status,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
