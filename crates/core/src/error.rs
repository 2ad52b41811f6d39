use serde::{Deserialize, Serialize};

/// Error taxonomy shared by the transport, store and registry layers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    /// Connection reset, timeout, 5xx. Retried internally.
    #[error("network: {0}")]
    NetworkTransient(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// Write rejected due to a stale resourceVersion. Never auto-retried.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Watch resume point expired server-side; re-list required.
    #[error("gone: {0}")]
    Gone(String),
    /// A single record failed to decode.
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("invalid_params: {0}")]
    InvalidParams(String),
    #[error("config: {0}")]
    Config(String),
    #[error("superseded by a newer load")]
    Superseded,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Map an HTTP status from the API server.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            410 => Self::Gone(message),
            400 | 422 => Self::InvalidParams(message),
            408 | 429 | 500..=599 => Self::NetworkTransient(message),
            _ => Self::Internal(format!("HTTP {code}: {message}")),
        }
    }

    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool { matches!(self, Self::NetworkTransient(_)) }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    /// Needs a user decision (credentials, permissions).
    pub fn is_auth(&self) -> bool { matches!(self, Self::Unauthorized(_) | Self::Forbidden(_)) }
}
