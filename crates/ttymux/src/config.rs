//! Configuration management for the ttymux daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ttymux/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tty::bridge::default_shell;
use crate::tty::{
    DetachedTerminal, HostTerminal, SessionManager, ShellCommand, TerminalControl, WindowSize,
};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("reap_interval_secs must be between 1 and 3600, got {0}")]
    InvalidReapInterval(u64),

    #[error("window size must be at least 1x1, got {rows}x{cols}")]
    InvalidWindowSize { rows: u16, cols: u16 },

    #[error("listen must be a socket address such as 127.0.0.1:7681, got {0}")]
    InvalidListenAddress(String),

    #[error("shell not found: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default address the daemon listens on.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7681";

/// Main configuration structure for the ttymux daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Settings applied to every new session.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP address accepting remote connections.
    pub listen: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Seconds between sweeps that drop finished sessions.
    pub reap_interval_secs: u64,
}

/// Which terminal new bridges run under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    /// The daemon's own standard input; raw mode is applied to it.
    Host,
    /// No terminal; ptys use the configured size.
    #[default]
    Detached,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell program run in each pty.
    pub shell: String,

    /// Arguments passed to the shell.
    pub args: Vec<String>,

    /// Working directory for new shells.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Terminal mode for new bridges.
    pub terminal: TerminalMode,

    /// Pty width when running detached.
    pub cols: u16,

    /// Pty height when running detached.
    pub rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Extra environment variables for the shell.
    pub env: BTreeMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            log_level: "info".to_string(),
            reap_interval_secs: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let size = WindowSize::default();
        Self {
            shell: default_shell(),
            args: Vec::new(),
            cwd: None,
            terminal: TerminalMode::default(),
            cols: size.cols,
            rows: size.rows,
            max_sessions: 10,
            env: BTreeMap::new(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ttymux")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TTYMUX_LISTEN: Override the listen address
    /// - TTYMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TTYMUX_SHELL: Override the session shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("TTYMUX_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen from environment: {}", listen);
                self.daemon.listen = listen;
            }
        }

        if let Ok(level) = std::env::var("TTYMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("TTYMUX_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.session.shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.daemon.reap_interval_secs < 1 || self.daemon.reap_interval_secs > 3600 {
            return Err(ConfigError::InvalidReapInterval(
                self.daemon.reap_interval_secs,
            ));
        }

        if self.session.rows == 0 || self.session.cols == 0 {
            return Err(ConfigError::InvalidWindowSize {
                rows: self.session.rows,
                cols: self.session.cols,
            });
        }

        self.listen_addr()?;

        let shell_path = Path::new(&self.session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
            }
        } else if which::which(&self.session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Parses the listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.daemon
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.daemon.listen.clone()))
    }

    /// The command every new session runs.
    pub fn shell_command(&self) -> ShellCommand {
        let mut command = ShellCommand::new(&self.session.shell);
        command.args = self.session.args.clone();
        command.env = self.session.env.clone();
        command.cwd = self.session.cwd.clone();
        command
    }

    /// Window size used by detached bridges.
    pub fn window_size(&self) -> WindowSize {
        WindowSize::new(self.session.rows, self.session.cols)
    }

    /// Builds the terminal new bridges run under.
    pub fn terminal(&self) -> Arc<dyn TerminalControl> {
        match self.session.terminal {
            TerminalMode::Host => Arc::new(HostTerminal::new()),
            TerminalMode::Detached => Arc::new(DetachedTerminal::new(self.window_size())),
        }
    }

    /// Builds a session manager that spawns the configured shell.
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::from_config(self)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
