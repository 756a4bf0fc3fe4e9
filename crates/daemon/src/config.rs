//! Configuration management for the procmux daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/procmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::TerminalMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::buffer::DEFAULT_MAX_BUFFER_LINES;
use crate::session::process::detect_shell;
use crate::session::SessionSettings;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_buffer_lines must be greater than 0, got {0}")]
    InvalidMaxBufferLines(usize),

    #[error("kill_grace_ms must be at most 10000, got {0}")]
    InvalidKillGrace(u64),

    #[error("reap_interval_secs must be greater than 0, got {0}")]
    InvalidReapInterval(u64),

    #[error("default terminal size must be non-zero, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for `kill_grace_ms`.
const MAX_KILL_GRACE_MS: u64 = 10_000;

/// Main configuration structure for the procmux daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Override of the IPC socket location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell spawned when a request names no command.
    pub default_shell: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Line bound of each session's output buffer.
    pub max_buffer_lines: usize,

    /// Milliseconds `kill` waits for the process to exit.
    pub kill_grace_ms: u64,

    /// Milliseconds `read` waits when the request gives no wait.
    pub default_read_wait_ms: u64,

    /// Terminal columns when the request gives none.
    pub default_cols: u16,

    /// Terminal rows when the request gives none.
    pub default_rows: u16,

    /// Terminal mode when the request gives none (pipe or pty).
    pub terminal: TerminalMode,

    /// Seconds between sweeps for exited sessions.
    pub reap_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            socket_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: detect_shell(None),
            max_sessions: 64,
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
            kill_grace_ms: 100,
            default_read_wait_ms: 100,
            default_cols: protocol::DEFAULT_COLS,
            default_rows: protocol::DEFAULT_ROWS,
            terminal: TerminalMode::Pipe,
            reap_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    /// Session manager settings described by this section.
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            default_shell: self.default_shell.clone(),
            max_sessions: self.max_sessions,
            max_buffer_lines: self.max_buffer_lines,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            default_read_wait: Duration::from_millis(self.default_read_wait_ms),
            default_cols: self.default_cols,
            default_rows: self.default_rows,
            default_terminal: self.terminal,
        }
    }

    /// Interval of the background reaper.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("procmux")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PROCMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PROCMUX_SOCKET: Override the IPC socket path
    /// - PROCMUX_MAX_SESSIONS: Override the session cap
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PROCMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(socket) = std::env::var("PROCMUX_SOCKET") {
            if !socket.is_empty() {
                tracing::info!("Overriding socket_path from environment: {}", socket);
                self.daemon.socket_path = Some(PathBuf::from(socket));
            }
        }

        if let Ok(max) = std::env::var("PROCMUX_MAX_SESSIONS") {
            match max.parse::<usize>() {
                Ok(max) => {
                    tracing::info!("Overriding max_sessions from environment: {}", max);
                    self.session.max_sessions = max;
                }
                Err(_) if max.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring PROCMUX_MAX_SESSIONS={:?}: {}", max, e);
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.max_buffer_lines == 0 {
            return Err(ConfigError::InvalidMaxBufferLines(session.max_buffer_lines));
        }

        if session.kill_grace_ms > MAX_KILL_GRACE_MS {
            return Err(ConfigError::InvalidKillGrace(session.kill_grace_ms));
        }

        if session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval(session.reap_interval_secs));
        }

        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize(
                session.default_cols,
                session.default_rows,
            ));
        }

        // Validate default_shell path exists
        let shell_path = Path::new(&session.default_shell);

        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
            }
        } else if which::which(&session.default_shell).is_err() {
            // For non-absolute paths, try to find in PATH
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
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
    ///
    /// The default path is `~/.config/procmux/config.toml`.
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
