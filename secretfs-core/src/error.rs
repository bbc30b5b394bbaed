//! Error model.
//!
//! One enum covers every failure the daemon distinguishes. The FUSE layer
//! maps `NotFound` to `ENOENT` and everything else to `EIO`; the plugin HTTP
//! layer maps all of them to a 500 with an `Err` body.

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The secret or volume does not exist.
    #[error("not found")]
    NotFound,

    /// The backend rejected our auth token. The session logs out defensively
    /// and the next call re-authenticates.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Network or TLS failure talking to the backend.
    #[error("transport: {0}")]
    Transport(String),

    /// Invalid or incomplete options. Never retried.
    #[error("invalid option {field}: {reason}")]
    Config { field: &'static str, reason: String },

    /// State-file read/write failure.
    #[error("persistence: {0}")]
    Persistence(String),

    /// Unexpected invariant violation. Logged and surfaced, process continues.
    #[error("internal: {0}")]
    Internal(String),
}

impl SecretError {
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the error indicates the auth token may be stale and the
    /// session should log out before the next attempt.
    pub fn is_auth_suspect(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Transport(_))
    }
}
