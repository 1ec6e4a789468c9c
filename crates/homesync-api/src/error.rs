use thiserror::Error;

/// Top-level error type for the `homesync-api` crate.
///
/// Covers every failure mode of a hub connection: the auth handshake,
/// the transport, request correlation, and semantic rejections from the
/// hub itself. `homesync-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The hub answered the handshake with `auth_invalid`.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Connection lifecycle ────────────────────────────────────────
    /// `connect()` was called while a connection is already live.
    #[error("Already connected to the hub")]
    AlreadyConnected,

    /// The request was issued (or was in flight) while not connected.
    #[error("Hub client disconnected")]
    Disconnected,

    // ── Transport ───────────────────────────────────────────────────
    /// Read/write failure on the WebSocket, or an unexpected frame
    /// during the handshake.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// No response arrived within the request deadline.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Hub ─────────────────────────────────────────────────────────
    /// The hub answered `success: false`.
    #[error("Hub rejected request ({code}): {message}")]
    Remote { code: String, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Returns `true` if the hub rejected our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Disconnected
        )
    }

    /// Extract the hub's error code, if available.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}
