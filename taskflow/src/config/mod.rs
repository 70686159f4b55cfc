//! Configuration system for the `Taskflow` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/taskflow/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use taskflow_proto::task::{Priority, TaskStatus};

use crate::cache::DEFAULT_TTL;
use crate::realtime::{Backoff, ChannelConfig, DEFAULT_CONNECT_TIMEOUT, ReconnectPolicy};
use crate::view::SortKey;

/// Default REST API base URL.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    api: ApiFileConfig,
    cache: CacheFileConfig,
    realtime: RealtimeFileConfig,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    api_url: Option<String>,
    ws_url: Option<String>,
    token: Option<String>,
    user_id: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    cache_ttl_secs: Option<u64>,
}

/// `[realtime]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RealtimeFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    backoff: Option<Backoff>,
    connect_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    // -- API --
    /// REST API base URL.
    pub api_url: String,
    /// WebSocket base URL; derived from `api_url` when not set.
    pub ws_url: Option<String>,
    /// Bearer token from a previous login.
    pub token: Option<String>,
    /// User id for the notification socket.
    pub user_id: Option<String>,
    /// Timeout for each REST request.
    pub request_timeout: Duration,

    // -- Cache --
    /// Lifetime of cached responses.
    pub cache_ttl: Duration,

    // -- Realtime --
    /// Timeout for opening the notification socket.
    pub connect_timeout: Duration,
    /// Reconnect schedule for the notification socket.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: derive_ws_url(DEFAULT_API_URL),
            token: None,
            user_id: None,
            request_timeout: crate::http::remote::DEFAULT_TIMEOUT,
            cache_ttl: DEFAULT_TTL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/taskflow/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let realtime = &file.realtime;

        let api_url = cli
            .api_url
            .clone()
            .or_else(|| file.api.api_url.clone())
            .unwrap_or(defaults.api_url);
        let ws_url = cli
            .ws_url
            .clone()
            .or_else(|| file.api.ws_url.clone())
            .or_else(|| derive_ws_url(&api_url));

        Self {
            ws_url,
            token: cli.token.clone().or_else(|| file.api.token.clone()),
            user_id: cli.user_id.clone().or_else(|| file.api.user_id.clone()),
            request_timeout: file
                .api
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            cache_ttl: file
                .cache
                .cache_ttl_secs
                .map_or(defaults.cache_ttl, Duration::from_secs),
            connect_timeout: realtime
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect: ReconnectPolicy {
                base_delay: realtime
                    .base_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
                max_delay: realtime
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: realtime
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                backoff: realtime.backoff.unwrap_or(defaults.reconnect.backoff),
            },
            api_url,
        }
    }

    /// Settings for the notification channel.
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            ws_url: self.ws_url.clone(),
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect,
        }
    }
}

/// `http://host` becomes `ws://host`, `https://host` becomes `wss://host`.
/// Returns `None` for any other scheme.
#[must_use]
pub fn derive_ws_url(api_url: &str) -> Option<String> {
    if let Some(rest) = api_url.strip_prefix("https://") {
        Some(format!("wss://{rest}"))
    } else {
        api_url
            .strip_prefix("http://")
            .map(|rest| format!("ws://{rest}"))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Command-line client for Taskflow task lists")]
pub struct CliArgs {
    /// REST API base URL.
    #[arg(long, global = true, env = "TASKFLOW_API_URL")]
    pub api_url: Option<String>,

    /// WebSocket base URL (default: derived from the API URL).
    #[arg(long, global = true, env = "TASKFLOW_WS_URL")]
    pub ws_url: Option<String>,

    /// Bearer token (see `taskflow login`).
    #[arg(long, global = true, env = "TASKFLOW_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Your user id, for `taskflow watch`.
    #[arg(long, global = true, env = "TASKFLOW_USER_ID")]
    pub user_id: Option<String>,

    /// Path to config file (default: `~/.config/taskflow/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "TASKFLOW_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/taskflow.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// What to do (default: `list`).
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List tasks.
    List {
        /// Only `pending` or `completed` tasks.
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Only tasks with this priority.
        #[arg(long)]
        priority: Option<Priority>,
        /// Only tasks with this tag.
        #[arg(long)]
        tag: Option<String>,
        /// Only tasks whose title or description contains this text.
        #[arg(long)]
        search: Option<String>,
        /// Sort order: created, due, priority or title.
        #[arg(long, default_value = "created")]
        sort: SortKey,
    },
    /// Show one task.
    Show {
        /// Task id.
        id: String,
    },
    /// Create a task.
    Add {
        /// Title.
        title: String,
        /// Description.
        #[arg(long)]
        description: Option<String>,
        /// Priority (low, medium, high).
        #[arg(long)]
        priority: Option<Priority>,
        /// Due date (YYYY-MM-DD).
        #[arg(long)]
        due: Option<NaiveDate>,
        /// Tag; repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Project id.
        #[arg(long)]
        project: Option<String>,
    },
    /// Change fields of a task.
    Edit {
        /// Task id.
        id: String,
        /// New title.
        #[arg(long)]
        title: Option<String>,
        /// New description.
        #[arg(long)]
        description: Option<String>,
        /// New priority.
        #[arg(long)]
        priority: Option<Priority>,
        /// New due date (YYYY-MM-DD).
        #[arg(long)]
        due: Option<NaiveDate>,
        /// Replacement tags; repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// New project id.
        #[arg(long)]
        project: Option<String>,
    },
    /// Flip a task between pending and completed.
    Toggle {
        /// Task id.
        id: String,
    },
    /// Delete a task.
    Rm {
        /// Task id.
        id: String,
    },
    /// Log in and print the token.
    Login {
        /// Account name.
        username: String,
        /// Password.
        password: String,
    },
    /// Show dashboard counts.
    Stats,
    /// Print notifications as they arrive, until Ctrl-C.
    Watch,
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
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("taskflow").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
