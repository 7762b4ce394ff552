//! Server configuration: TOML file + CLI overrides.

use crate::router::RateLimitConfig;
use crate::session::pty::SpawnRequest;
use crate::session::RegistrySettings;
use ptymux_core::{MuxError, MuxResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-connection outbound queue length, in messages.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Seconds between server pings.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    /// Extra seconds of silence tolerated after a ping.
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            outbound_queue: default_outbound_queue(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Typed into the first session once it is up.
    #[serde(default)]
    pub startup_command: Option<String>,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            cols: default_cols(),
            rows: default_rows(),
            shell: None,
            cwd: None,
            env: HashMap::new(),
            startup_command: None,
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

/// `[rate_limit]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_max_sessions() -> usize {
    64
}
fn default_outbound_queue() -> usize {
    1024
}
fn default_keepalive_interval() -> u64 {
    25
}
fn default_keepalive_timeout() -> u64 {
    20
}
fn default_history_capacity() -> usize {
    512 * 1024
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    30
}
fn default_startup_delay_ms() -> u64 {
    500
}
fn default_rate_capacity() -> u32 {
    crate::router::rate_limit::DEFAULT_CAPACITY
}
fn default_refill_per_sec() -> u32 {
    crate::router::rate_limit::DEFAULT_REFILL_PER_SEC
}

/// Values given on the command line; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub history_capacity: Option<usize>,
    pub shell: Option<String>,
    pub startup_command: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_sessions: usize,
    pub outbound_queue: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub history_capacity: usize,
    pub cols: u16,
    pub rows: u16,
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub startup_command: Option<String>,
    pub startup_delay: Duration,
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> MuxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| MuxError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> MuxResult<Self> {
        let bind_str = cli.bind.clone().unwrap_or(file.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| MuxError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;

        let outbound_queue = file.server.outbound_queue;
        if outbound_queue == 0 {
            return Err(MuxError::Config("server.outbound_queue must be at least 1".into()));
        }
        if file.session.cols == 0 || file.session.rows == 0 {
            return Err(MuxError::Config("session.cols and session.rows must be nonzero".into()));
        }
        if file.server.keepalive_interval == 0 {
            return Err(MuxError::Config("server.keepalive_interval must be nonzero".into()));
        }

        let shell = cli
            .shell
            .clone()
            .or(file.session.shell)
            .unwrap_or_else(default_shell);
        let cwd = match file.session.cwd {
            Some(dir) => Some(expand_tilde_str(&dir)),
            None => dirs::home_dir(),
        };
        let startup_command = cli
            .startup_command
            .clone()
            .or(file.session.startup_command)
            .filter(|cmd| !cmd.trim().is_empty());

        Ok(Self {
            bind,
            port: cli.port.unwrap_or(file.server.port),
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),
            outbound_queue,
            keepalive_interval: Duration::from_secs(file.server.keepalive_interval),
            keepalive_timeout: Duration::from_secs(file.server.keepalive_timeout),
            history_capacity: cli
                .history_capacity
                .unwrap_or(file.session.history_capacity),
            cols: file.session.cols,
            rows: file.session.rows,
            shell,
            cwd,
            env: file.session.env,
            startup_command,
            startup_delay: Duration::from_millis(file.session.startup_delay_ms),
            rate_limit: RateLimitConfig {
                capacity: file.rate_limit.capacity,
                refill_per_sec: file.rate_limit.refill_per_sec,
            },
        })
    }

    /// Registry limits and spawn defaults derived from this config.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_sessions: self.max_sessions,
            history_capacity: self.history_capacity,
            spawn: SpawnRequest {
                shell: self.shell.clone(),
                cwd: self.cwd.clone(),
                env: self.env.clone(),
                cols: self.cols,
                rows: self.rows,
            },
        }
    }
}

/// `$SHELL`, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
