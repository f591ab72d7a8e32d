//! Daemon configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. TOML config file (if given via `--config` or `PRONTRD_CONFIG`)
//! 3. Environment variables (`PRONTRD_SOCKET`, `PRONTRD_LOG`)
//! 4. Command-line flags, applied by the binary

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::PowerSettle;
use crate::error::ConfigError;
use crate::server::ServerOptions;
use crate::{DEFAULT_SOCKET_PATH, MAX_MESSAGE_SIZE};

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Listening socket path. `~` is expanded.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after binding.
    pub socket_mode: u32,
    /// Upper bound on one readiness wait, in milliseconds.
    pub poll_interval_ms: u64,
    /// Largest accepted request in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue bound. Unbounded when absent.
    pub max_pending_responses: Option<usize>,
    /// How long a power switch may take to report the requested state.
    pub power_settle_timeout_ms: u64,
    pub pid_file: Option<PathBuf>,
    pub logging: LogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: 0o600,
            poll_interval_ms: 100,
            max_message_size: MAX_MESSAGE_SIZE,
            max_pending_responses: None,
            power_settle_timeout_ms: 500,
            pid_file: None,
            logging: LogConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Defaults, then the optional file, then environment overrides.
    /// The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PRONTRD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("PRONTRD_SOCKET").filter(|p| !p.is_empty()) {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(level) = var("PRONTRD_LOG").filter(|l| !l.is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("socket_path must not be empty".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Validation(
                "max_message_size must be greater than zero".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_pending_responses == Some(0) {
            return Err(ConfigError::Validation(
                "max_pending_responses must be greater than zero when set".into(),
            ));
        }
        if self.socket_mode > 0o777 {
            return Err(ConfigError::Validation(format!(
                "socket_mode {:o} is not a permission mask",
                self.socket_mode
            )));
        }
        Ok(())
    }

    /// Socket path with `~` expanded.
    pub fn socket_path(&self) -> PathBuf {
        expand_path(&self.socket_path)
    }

    /// PID file path with `~` expanded.
    pub fn pid_file(&self) -> Option<PathBuf> {
        self.pid_file.as_deref().map(expand_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn power_settle(&self) -> PowerSettle {
        PowerSettle {
            timeout: Duration::from_millis(self.power_settle_timeout_ms),
            ..PowerSettle::default()
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            socket_mode: self.socket_mode,
            poll_interval: self.poll_interval(),
            max_message_size: self.max_message_size,
            max_pending_responses: self.max_pending_responses,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
    /// Log file. Logs go to stderr when absent.
    pub file: Option<PathBuf>,
    /// Rotate the log file daily. Needs the `log-rotation` feature.
    pub rotate: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            rotate: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Expand `~` in a path to the home directory.
pub(crate) fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(&path_str);
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DaemonConfig::default();
        config.validate().unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/prontrd.sock"));
        assert_eq!(config.socket_mode, 0o600);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.max_message_size, 2048);
        assert_eq!(config.max_pending_responses, None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml_str(
            r#"
            socket_path = "/run/prontrd/prontrd.sock"
            socket_mode = 0o660
            max_pending_responses = 32

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/prontrd/prontrd.sock"));
        assert_eq!(config.socket_mode, 0o660);
        assert_eq!(config.max_pending_responses, Some(32));
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.file, None);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = DaemonConfig::from_toml_str("sokcet_path = \"/tmp/x.sock\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = DaemonConfig::default();
        config.max_message_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = DaemonConfig::default();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.socket_path = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.max_pending_responses = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "power_settle_timeout_ms = 250").unwrap();

        let config = DaemonConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.power_settle().timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file() {
        let err = DaemonConfig::from_file("/nonexistent/prontrd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_overrides() {
        let mut config = DaemonConfig::default();
        config.apply_overrides(|key| match key {
            "PRONTRD_SOCKET" => Some("/tmp/override.sock".to_string()),
            "PRONTRD_LOG" => Some("prontrd=trace".to_string()),
            _ => None,
        });
        assert_eq!(config.socket_path, PathBuf::from("/tmp/override.sock"));
        assert_eq!(config.logging.level, "prontrd=trace");

        // empty values are ignored
        config.apply_overrides(|_| Some(String::new()));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/override.sock"));
    }

    #[test]
    fn test_expand_path() {
        let expanded = expand_path(Path::new("~/.prontrd/test.sock"));
        assert!(!expanded.to_string_lossy().contains('~'));
    }
}
