//! CLI error types with miette diagnostics.
//!
//! Maps core and config errors into user-facing errors with help text
//! and a process exit code.

use miette::Diagnostic;
use thiserror::Error;

use homesync_config::ConfigError;
use homesync_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to hub at {url}")]
    #[diagnostic(
        code(homesync::connection_failed),
        help(
            "Check that the hub is running and its WebSocket API is reachable.\n\
             URL: {url}"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Hub connection lost")]
    #[diagnostic(code(homesync::disconnected))]
    Disconnected,

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(homesync::auth_failed),
        help("Create a new long-lived access token in the hub's user profile.")
    )]
    AuthFailed { message: String },

    #[error("No hub access token configured")]
    #[diagnostic(
        code(homesync::no_credentials),
        help(
            "Set HA_TOKEN, point hub.token_env at a variable holding the token,\n\
             or store it in the keyring under service \"homesync\", entry \"hub-token\"."
        )
    )]
    NoCredentials,

    // ── Hub ──────────────────────────────────────────────────────────
    #[error("Hub rejected request ({code}): {message}")]
    #[diagnostic(code(homesync::remote))]
    Remote { code: String, message: String },

    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(homesync::timeout),
        help("Raise hub.request_timeout_secs or check hub responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── State ────────────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(homesync::state))]
    State(CoreError),

    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(homesync::validation))]
    Validation { field: String, reason: String },

    #[error("Config file already exists: {path}")]
    #[diagnostic(
        code(homesync::config_exists),
        help("Pass --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(homesync::config))]
    Config(Box<figment::Error>),

    #[error("Failed to render config: {0}")]
    #[diagnostic(code(homesync::config))]
    ConfigRender(String),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            Self::ConfigExists { .. } => exit_code::CONFLICT,
            _ => exit_code::GENERAL,
        }
    }

    /// Translate a failed initial connect, naming the URL for transport
    /// failures.
    pub fn from_connect(err: homesync_api::Error, url: &str) -> Self {
        match err {
            homesync_api::Error::Transport { message } => Self::ConnectionFailed {
                url: url.to_owned(),
                reason: message,
            },
            other => CoreError::from(other).into(),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::Transport { message } => Self::ConnectionFailed {
                url: "(connected hub)".into(),
                reason: message,
            },
            CoreError::Disconnected => Self::Disconnected,
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },
            CoreError::Remote { code, message } => Self::Remote { code, message },
            other => Self::State(other),
        }
    }
}

impl From<homesync_api::Error> for CliError {
    fn from(err: homesync_api::Error) -> Self {
        CoreError::from(err).into()
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::NoCredentials => Self::NoCredentials,
            ConfigError::AlreadyExists { path } => Self::ConfigExists {
                path: path.display().to_string(),
            },
            ConfigError::Serialization(e) => Self::ConfigRender(e.to_string()),
            ConfigError::Figment(e) => Self::Config(e),
            ConfigError::Io(e) => Self::Io(e),
        }
    }
}
