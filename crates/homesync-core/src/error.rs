// ── Core error types ──
//
// Errors surfaced by the state store. Catalog and type misuse are
// programmer errors; hub failures arrive through the
// `From<homesync_api::Error>` impl, translated into domain variants.

use thiserror::Error;

use crate::catalog::ValueKind;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Catalog / type errors ────────────────────────────────────────
    #[error("Unknown state variable: {key}")]
    UnknownKey { key: String },

    #[error("Type mismatch for {key}: declared {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("State variable {key} has not been initialized")]
    NotInitialized { key: String },

    #[error("Cannot convert hub state {raw:?} to {kind} for {key}")]
    Conversion {
        key: String,
        raw: String,
        kind: ValueKind,
    },

    #[error("Invalid structured value for {key}: {message}")]
    Serialization { key: String, message: String },

    // ── Write policy ─────────────────────────────────────────────────
    #[error("Store is in read-only mode, refusing to write {key}")]
    ReadOnlyMode { key: String },

    // ── Hub errors (wrapped, not exposed raw) ────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Hub transport failed: {message}")]
    Transport { message: String },

    #[error("Hub request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Hub disconnected")]
    Disconnected,

    #[error("Hub rejected request ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The write was refused because the store is observe-only. Callers
    /// usually log this at debug rather than treat it as a failure.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnlyMode { .. })
    }

    /// Returns `true` for failures that originate at the hub connection.
    pub fn is_hub_error(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. }
                | Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::Disconnected
                | Self::Remote { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<homesync_api::Error> for CoreError {
    fn from(err: homesync_api::Error) -> Self {
        match err {
            homesync_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            homesync_api::Error::Transport { message } => CoreError::Transport { message },
            homesync_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            homesync_api::Error::Disconnected => CoreError::Disconnected,
            homesync_api::Error::AlreadyConnected => {
                CoreError::Internal("hub client already connected".into())
            }
            homesync_api::Error::Remote { code, message } => CoreError::Remote { code, message },
            homesync_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}
