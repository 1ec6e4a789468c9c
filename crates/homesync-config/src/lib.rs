//! Configuration for the homesync daemon.
//!
//! A single TOML file layered under `HOMESYNC_*` environment variables,
//! token resolution (env + keyring + plaintext), and translation to
//! `homesync_api::ClientConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use homesync_api::{ClientConfig, ReconnectConfig};

/// Keyring service name used for stored tokens.
pub const KEYRING_SERVICE: &str = "homesync";
/// Keyring entry holding the hub access token.
pub const KEYRING_TOKEN_ENTRY: &str = "hub-token";
/// Fallback environment variable consulted for the token.
pub const DEFAULT_TOKEN_ENV: &str = "HA_TOKEN";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no hub access token configured")]
    NoCredentials,

    #[error("config file already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Observe only: refuse every write that would reach the hub.
    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub hub: HubSection,
}

/// `[hub]` connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HubSection {
    /// WebSocket endpoint, e.g. `ws://homeassistant.local:8123/api/websocket`.
    #[serde(default = "default_url")]
    pub url: String,

    /// Environment variable holding the access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Access token (plaintext, prefer keyring or env var).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectSection,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            token_env: None,
            token: None,
            request_timeout_secs: default_request_timeout(),
            reconnect: ReconnectSection::default(),
        }
    }
}

/// `[hub.reconnect]` backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// 0 retries forever.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_retries: 0,
        }
    }
}

fn default_url() -> String {
    "ws://homeassistant.local:8123/api/websocket".into()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_initial_delay() -> u64 {
    1
}
fn default_max_delay() -> u64 {
    30
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "homesync", "homesync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("homesync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load defaults, then the TOML file (if present), then `HOMESYNC_*`
/// environment variables (`HOMESYNC_HUB__URL` → `hub.url`).
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("HOMESYNC_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config init ─────────────────────────────────────────────────────

const DEFAULT_HEADER: &str = "\
# homesync configuration
#
# Every key can be overridden from the environment, e.g.
#   HOMESYNC_READ_ONLY=true
#   HOMESYNC_HUB__URL=ws://hub.local:8123/api/websocket
#
# The access token is looked up in this order:
#   1. the variable named by hub.token_env
#   2. HA_TOKEN
#   3. the system keyring (service \"homesync\", entry \"hub-token\")
#   4. hub.token below
";

/// Default config file contents, with an explanatory header.
pub fn render_default_config() -> Result<String, ConfigError> {
    let body = toml::to_string_pretty(&Config::default())?;
    Ok(format!("{DEFAULT_HEADER}\n{body}"))
}

/// Write the default config to `path`, refusing to overwrite unless
/// `force` is set.
pub fn write_default_config(path: &Path, force: bool) -> Result<(), ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_default_config()?)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the hub token: `token_env` → `HA_TOKEN` → keyring → plaintext.
pub fn resolve_token(hub: &HubSection) -> Result<SecretString, ConfigError> {
    resolve_token_from(
        hub,
        |name| std::env::var(name).ok(),
        || {
            keyring::Entry::new(KEYRING_SERVICE, KEYRING_TOKEN_ENTRY)
                .and_then(|entry| entry.get_password())
                .ok()
        },
    )
}

/// [`resolve_token`] with injectable environment and keyring lookups.
pub fn resolve_token_from(
    hub: &HubSection,
    env: impl Fn(&str) -> Option<String>,
    keyring: impl FnOnce() -> Option<String>,
) -> Result<SecretString, ConfigError> {
    let non_empty = |s: String| (!s.trim().is_empty()).then_some(s);

    if let Some(token) = hub.token_env.as_deref().and_then(&env).and_then(non_empty) {
        return Ok(SecretString::from(token));
    }
    if let Some(token) = env(DEFAULT_TOKEN_ENV).and_then(non_empty) {
        return Ok(SecretString::from(token));
    }
    if let Some(token) = keyring().and_then(non_empty) {
        return Ok(SecretString::from(token));
    }
    if let Some(token) = hub.token.clone().and_then(non_empty) {
        return Ok(SecretString::from(token));
    }

    Err(ConfigError::NoCredentials)
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `ClientConfig` from the `[hub]` section and a resolved token.
pub fn to_client_config(hub: &HubSection, token: SecretString) -> Result<ClientConfig, ConfigError> {
    let url: url::Url = hub.url.parse().map_err(|_| ConfigError::Validation {
        field: "hub.url".into(),
        reason: format!("invalid URL: {}", hub.url),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::Validation {
            field: "hub.url".into(),
            reason: format!("expected a ws:// or wss:// URL, got '{}'", url.scheme()),
        });
    }
    if hub.request_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            field: "hub.request_timeout_secs".into(),
            reason: "must be at least 1".into(),
        });
    }

    let reconnect = &hub.reconnect;
    if reconnect.initial_delay_secs == 0 || reconnect.max_delay_secs < reconnect.initial_delay_secs
    {
        return Err(ConfigError::Validation {
            field: "hub.reconnect".into(),
            reason: "need 0 < initial_delay_secs <= max_delay_secs".into(),
        });
    }

    let mut config = ClientConfig::new(url, token);
    config.request_timeout = Duration::from_secs(hub.request_timeout_secs);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_secs(reconnect.initial_delay_secs),
        max_delay: Duration::from_secs(reconnect.max_delay_secs),
        max_retries: (reconnect.max_retries > 0).then_some(reconnect.max_retries),
    };
    Ok(config)
}

/// Resolve the token and build the client config in one step.
pub fn client_config(config: &Config) -> Result<ClientConfig, ConfigError> {
    let token = resolve_token(&config.hub)?;
    to_client_config(&config.hub, token)
}
