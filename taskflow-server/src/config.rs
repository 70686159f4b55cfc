//! Settings for the reference server.
//!
//! Values come from command-line flags (which also read `TASKFLOW_SERVER_*`
//! environment variables), then `~/.config/taskflow-server/config.toml`,
//! then built-in defaults:
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1:8000"
//! log_level = "debug"
//!
//! [demo]
//! seed = true
//! username = "demo"
//! password = "demo"
//! ```

use std::path::{Path, PathBuf};

/// Address used when neither a flag nor the file names one.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DEMO_CREDENTIAL: &str = "demo";

/// Why the server settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file exists (or was named explicitly) but is unreadable.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        /// File that was opened.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this schema.
    #[error("invalid server settings: {0}")]
    ParseToml(#[from] toml::de::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SettingsFile {
    server: ServerSection,
    demo: DemoSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DemoSection {
    seed: Option<bool>,
    username: Option<String>,
    password: Option<String>,
}

/// Command-line flags of `taskflow-server`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "In-memory Taskflow REST and notification server")]
pub struct ServerCliArgs {
    /// Listen address, e.g. `0.0.0.0:8000`.
    #[arg(short, long, env = "TASKFLOW_SERVER_ADDR")]
    pub bind: Option<String>,

    /// Settings file to use instead of the per-user one.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seed a demo account with sample tasks.
    #[arg(long)]
    pub seed_demo: bool,

    /// `tracing` filter such as `info` or `taskflow_server=debug`.
    #[arg(long, env = "TASKFLOW_SERVER_LOG")]
    pub log_level: Option<String>,
}

/// Login of the account created by `--seed-demo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoAccount {
    /// Username.
    pub username: String,
    /// Plain-text password.
    pub password: String,
}

/// Settings the server runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_addr: String,
    /// Account to seed at startup.
    pub demo: Option<DemoAccount>,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            demo: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ServerConfig {
    /// Reads the settings file and overlays the flags on it.
    ///
    /// # Errors
    ///
    /// Fails when `--config` names a missing or unreadable file, or when
    /// any settings file does not parse. A missing per-user file is fine.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => read_settings(path)?,
            None => default_settings_path()
                .map(|path| read_optional_settings(&path))
                .transpose()?
                .unwrap_or_default(),
        };
        Ok(Self::merge(cli, file))
    }

    fn merge(cli: &ServerCliArgs, file: SettingsFile) -> Self {
        let SettingsFile { server, demo } = file;
        let seed = cli.seed_demo || demo.seed == Some(true);
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(server.bind_addr)
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            demo: seed.then(|| DemoAccount {
                username: demo
                    .username
                    .unwrap_or_else(|| DEFAULT_DEMO_CREDENTIAL.to_string()),
                password: demo
                    .password
                    .unwrap_or_else(|| DEFAULT_DEMO_CREDENTIAL.to_string()),
            }),
            log_level: cli
                .log_level
                .clone()
                .or(server.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        }
    }
}

fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("taskflow-server").join("config.toml"))
}

fn read_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn read_optional_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    match read_settings(path) {
        Err(ConfigError::ReadFile { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(SettingsFile::default())
        }
        other => other,
    }
}
