//! Configuration system for the `CollaborAid` messaging client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/collaboraid/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error. The bearer token is
//! never read from the file.

use std::path::PathBuf;
use std::time::Duration;

use collaboraid_proto::message::{Timestamp, UserId};
use collaboraid_proto::stomp::HeartBeat;

use crate::chat::queue::QueuePolicy;
use crate::session::Session;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting required to build a session is absent.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// The timestamp display format is not a valid chrono format string.
    #[error("invalid timestamp format {0:?}")]
    TimestampFormat(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
    connection: ConnectionFileConfig,
    queue: QueueFileConfig,
    ui: UiFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    ws_url: Option<String>,
    api_url: Option<String>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user_id: Option<i64>,
    username: Option<String>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    connect_timeout_secs: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    heartbeat_outgoing_ms: Option<u64>,
    heartbeat_incoming_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[queue]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct QueueFileConfig {
    max_attempts: Option<u32>,
    max_age_secs: Option<u64>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// STOMP WebSocket endpoint.
    pub ws_url: String,
    /// Base URL of the REST API.
    pub api_url: String,

    // -- Session --
    /// Signed-in user id.
    pub user_id: Option<i64>,
    /// Signed-in user display name.
    pub username: Option<String>,
    /// Bearer token (CLI or environment only).
    pub token: Option<String>,

    // -- Connection --
    /// Bound on the whole WebSocket + STOMP handshake.
    pub connect_timeout: Duration,
    /// Fixed pause between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Heart-beat offer sent in `CONNECT`.
    pub heart_beat: HeartBeat,
    /// Timeout for each REST request.
    pub request_timeout: Duration,
    /// Capacity of the inbound message fan-out channel.
    pub event_buffer: usize,

    // -- Queue --
    /// Retention policy of the outbound queue.
    pub queue: QueuePolicy,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ws".to_string(),
            api_url: "http://localhost:8080".to_string(),
            user_id: None,
            username: None,
            token: None,
            connect_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            heart_beat: HeartBeat::from_millis(10_000, 10_000),
            request_timeout: Duration::from_secs(30),
            event_buffer: 256,
            queue: QueuePolicy::default(),
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/collaboraid/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a resolved setting is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Check resolved settings that cannot be expressed in the types.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TimestampFormat`] for an unusable
    /// `timestamp_format`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Timestamp::is_valid_format(&self.timestamp_format) {
            return Err(ConfigError::TimestampFormat(self.timestamp_format.clone()));
        }
        Ok(())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let conn = &file.connection;

        Self {
            ws_url: cli
                .ws_url
                .clone()
                .or_else(|| file.server.ws_url.clone())
                .unwrap_or(defaults.ws_url),
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.server.api_url.clone())
                .unwrap_or(defaults.api_url),
            user_id: cli.user_id.or(file.session.user_id),
            username: cli
                .username
                .clone()
                .or_else(|| file.session.username.clone()),
            token: cli.token.clone(),
            connect_timeout: conn
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect_delay: conn
                .reconnect_delay_ms
                .map_or(defaults.reconnect_delay, Duration::from_millis),
            heart_beat: HeartBeat {
                outgoing: conn
                    .heartbeat_outgoing_ms
                    .map_or(defaults.heart_beat.outgoing, Duration::from_millis),
                incoming: conn
                    .heartbeat_incoming_ms
                    .map_or(defaults.heart_beat.incoming, Duration::from_millis),
            },
            request_timeout: conn
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            event_buffer: conn.event_buffer.unwrap_or(defaults.event_buffer),
            queue: QueuePolicy {
                max_attempts: file
                    .queue
                    .max_attempts
                    .unwrap_or(defaults.queue.max_attempts),
                max_age: file
                    .queue
                    .max_age_secs
                    .map_or(defaults.queue.max_age, Duration::from_secs),
            },
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Build the user [`Session`] from the resolved settings.
    ///
    /// A missing username falls back to `user-<id>`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the user id or token is absent.
    pub fn to_session(&self) -> Result<Session, ConfigError> {
        let user_id = self.user_id.ok_or(ConfigError::Missing("user id"))?;
        let token = self
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("token"))?;
        let username = self
            .username
            .clone()
            .unwrap_or_else(|| format!("user-{user_id}"));
        Ok(Session::new(UserId::new(user_id), username, token))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time messaging client for CollaborAid")]
pub struct CliArgs {
    /// STOMP WebSocket endpoint of the backend.
    #[arg(long, env = "COLLABORAID_WS_URL", global = true)]
    pub ws_url: Option<String>,

    /// Base URL of the backend REST API.
    #[arg(long, env = "COLLABORAID_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "COLLABORAID_USER_ID", global = true)]
    pub user_id: Option<i64>,

    /// Your display name.
    #[arg(long, env = "COLLABORAID_USERNAME", global = true)]
    pub username: Option<String>,

    /// Bearer token issued at login.
    #[arg(long, env = "COLLABORAID_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/collaboraid/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long, global = true)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COLLABORAID_LOG", global = true)]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/collaboraid.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

/// What the client should do.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Open a conversation with one peer and chat on stdin/stdout.
    Chat {
        /// The peer's user id.
        #[arg(long)]
        peer: i64,
    },
    /// Show conversation previews and follow new messages.
    Inbox,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("collaboraid").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
