//! TOML-based configuration for the nanohub transport and CLI.
//!
//! Reads `HubConfig` from the platform config location:
//! - Linux:   `$XDG_CONFIG_HOME/nanohub/config.toml` or `~/.config/nanohub/config.toml`
//! - macOS:   `~/Library/Application Support/nanohub/config.toml`
//!
//! A missing file is not an error: every field has a default, so the tool works
//! on a fresh device without any setup.
//!
//! ```toml
//! [transport]
//! device_path = "/dev/nanohub_comms"
//! lock_dir = "/data/vendor/sensor/nanohub_lock"
//! lock_file = "lock"
//! poll_interval_ms = 100
//! lock_wait_ms = 5000
//! debug_level = 0
//!
//! [logging]
//! log_level = "info"
//!
//! [session]
//! wait_timeout_secs = 30
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` take the value of
//! `some_fn()` when absent, so a partial file only overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Device link settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Character device carrying hub frames.
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,
    /// Directory watched for the exclusive-access lock file.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Lock file name inside `lock_dir`; reads pause while it exists.
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
    /// Upper bound on one poll of the device, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on one park while the lock file exists, in milliseconds.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Frame logging: `0` off, `1` headers, `2` headers and payload dumps.
    #[serde(default)]
    pub debug_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// How long the CLI waits for an operation's result.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_path() -> PathBuf {
    PathBuf::from("/dev/nanohub_comms")
}
fn default_lock_dir() -> PathBuf {
    PathBuf::from("/data/vendor/sensor/nanohub_lock")
}
fn default_lock_file() -> String {
    "lock".to_string()
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_lock_wait_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_wait_timeout_secs() -> u64 {
    30
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            lock_dir: default_lock_dir(),
            lock_file: default_lock_file(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            debug_level: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Full path of the lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir.join(&self.lock_file)
    }
}

impl SessionConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the default location.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<HubConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `HubConfig` from `path`, returning the defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<HubConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HubConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Resolves the platform config base directory with the `nanohub` suffix.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("nanohub")
        })
    }

    #[cfg(not(target_os = "macos"))]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("nanohub"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("nanohub_{tag}_{}_{nanos}", std::process::id()))
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_default_transport_points_at_nanohub_device() {
        // Arrange / Act
        let cfg = HubConfig::default();

        // Assert
        assert_eq!(cfg.transport.device_path, PathBuf::from("/dev/nanohub_comms"));
        assert_eq!(
            cfg.transport.lock_path(),
            PathBuf::from("/data/vendor/sensor/nanohub_lock/lock")
        );
        assert_eq!(cfg.transport.debug_level, 0);
    }

    #[test]
    fn test_default_durations() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.transport.poll_interval(), Duration::from_millis(100));
        assert_eq!(cfg.transport.lock_wait(), Duration::from_secs(5));
        assert_eq!(cfg.session.wait_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.logging.log_level, "info");
    }

    // ── TOML parsing ──────────────────────────────────────────────────────────

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: HubConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, HubConfig::default());
    }

    #[test]
    fn test_partial_transport_overrides_defaults() {
        // Arrange
        let toml_str = r#"
[transport]
device_path = "/tmp/fake_hub"
debug_level = 2
"#;

        // Act
        let cfg: HubConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.transport.device_path, PathBuf::from("/tmp/fake_hub"));
        assert_eq!(cfg.transport.debug_level, 2);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.transport.lock_file, "lock");
        assert_eq!(cfg.session.wait_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let result: Result<HubConfig, toml::de::Error> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_load_config_from_missing_file_returns_default() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/config.toml");
        let cfg = load_config_from(&path).expect("missing file is not an error");
        assert_eq!(cfg, HubConfig::default());
    }

    #[test]
    fn test_load_config_from_written_file() {
        // Arrange
        let dir = temp_dir("config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let mut cfg = HubConfig::default();
        cfg.transport.poll_interval_ms = 25;
        cfg.logging.log_level = "debug".to_string();
        std::fs::write(&path, toml::to_string_pretty(&cfg).unwrap()).unwrap();

        // Act
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_config_from_malformed_file_is_parse_error() {
        let dir = temp_dir("bad");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "transport = 5").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(
                path.ends_with("nanohub/config.toml"),
                "unexpected config path {path:?}"
            );
        }
        // NoPlatformConfigDir in a stripped environment is also acceptable.
    }
}
