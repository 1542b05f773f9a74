//! TOML-based configuration for the NearLink agent.
//!
//! Reads and writes [`AgentConfig`] at the platform-appropriate location:
//! - Windows:  `%APPDATA%\NearLink\config.toml`
//! - Linux:    `~/.config/nearlink/config.toml`
//! - macOS:    `~/Library/Application Support/NearLink/config.toml`
//!
//! Example:
//!
//! ```toml
//! [agent]
//! device_name = "kitchen-tag"
//! role = "auto"
//! beacon_id = 305419896
//!
//! [handshake]
//! connect_timeout_ms = 5000
//! connect_retries = 1
//! max_concurrent_peers = 1
//! ```
//!
//! Every field has a `#[serde(default = "...")]` so an empty file, or one
//! written by an older version, still loads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nearlink_core::{DeviceBeaconId, RolePreference};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::handshake_service::HandshakeConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level agent configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub handshake: HandshakeSection,
    #[serde(default)]
    pub demo: DemoSection,
}

/// Identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Schema version string.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Fixed beacon id.  A random one is drawn at startup when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacon_id: Option<u32>,
    #[serde(default)]
    pub role: RolePreference,
}

/// Handshake timing and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeSection {
    /// Bound on one connect attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Automatic retries after the first connect attempt.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_max_concurrent_peers")]
    pub max_concurrent_peers: usize,
    #[serde(default = "default_true")]
    pub suspend_advertising_as_controller: bool,
}

/// Settings for the loopback demo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemoSection {
    /// Interval between simulated ranging measurements.
    #[serde(default = "default_ranging_update_interval_ms")]
    pub ranging_update_interval_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_version() -> String {
    "1.0".to_string()
}
fn default_device_name() -> String {
    "nearlink-device".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_connect_retries() -> u32 {
    1
}
fn default_max_concurrent_peers() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_ranging_update_interval_ms() -> u64 {
    500
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            version: default_version(),
            device_name: default_device_name(),
            log_level: default_log_level(),
            beacon_id: None,
            role: RolePreference::Auto,
        }
    }
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
            max_concurrent_peers: default_max_concurrent_peers(),
            suspend_advertising_as_controller: default_true(),
        }
    }
}

impl Default for DemoSection {
    fn default() -> Self {
        Self {
            ranging_update_interval_ms: default_ranging_update_interval_ms(),
        }
    }
}

impl AgentConfig {
    /// Checks values that parse but cannot be used.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "handshake.connect_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.handshake.max_concurrent_peers == 0 {
            return Err(ConfigError::Invalid {
                field: "handshake.max_concurrent_peers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.demo.ranging_update_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "demo.ranging_update_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Builds the service settings, drawing a random beacon id if none is set.
    pub fn handshake_config(&self) -> HandshakeConfig {
        let beacon_id = match self.agent.beacon_id {
            Some(id) => DeviceBeaconId(id),
            None => DeviceBeaconId::random(&mut rand::thread_rng()),
        };
        HandshakeConfig {
            beacon_id,
            role_preference: self.agent.role,
            max_concurrent_peers: self.handshake.max_concurrent_peers,
            connect_retries: self.handshake.connect_retries,
            connect_timeout: Duration::from_millis(self.handshake.connect_timeout_ms),
            suspend_advertising_as_controller: self.handshake.suspend_advertising_as_controller,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the base directory cannot
/// be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the platform location.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads and validates the config at `path`, returning
/// `AgentConfig::default()` if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`] if a value is out of range.
pub fn load_config_from(path: &Path) -> Result<AgentConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AgentConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    config.validate()?;
    Ok(config)
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AgentConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("NearLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("nearlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("NearLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_agent_config_default_handshake_values() {
        // Arrange / Act
        let cfg = AgentConfig::default();

        // Assert
        assert_eq!(cfg.handshake.connect_timeout_ms, 5000);
        assert_eq!(cfg.handshake.connect_retries, 1);
        assert_eq!(cfg.handshake.max_concurrent_peers, 1);
        assert!(cfg.handshake.suspend_advertising_as_controller);
    }

    #[test]
    fn test_agent_section_default_is_auto_with_random_beacon() {
        let cfg = AgentSection::default();
        assert_eq!(cfg.role, RolePreference::Auto);
        assert_eq!(cfg.beacon_id, None);
        assert_eq!(cfg.log_level, "info");
    }

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AgentConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides_only_given_fields() {
        // Arrange
        let toml_str = r#"
[agent]
role = "controlee"
beacon_id = 42

[handshake]
connect_timeout_ms = 250
"#;

        // Act
        let cfg: AgentConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.agent.role, RolePreference::Controlee);
        assert_eq!(cfg.agent.beacon_id, Some(42));
        assert_eq!(cfg.handshake.connect_timeout_ms, 250);
        assert_eq!(cfg.handshake.connect_retries, 1);
        assert_eq!(cfg.demo.ranging_update_interval_ms, 500);
    }

    #[test]
    fn test_unknown_role_is_a_parse_error() {
        let result: Result<AgentConfig, _> = toml::from_str("[agent]\nrole = \"leader\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_absent_beacon_id_is_not_serialized() {
        let toml_str = toml::to_string_pretty(&AgentConfig::default()).expect("serialize");
        assert!(!toml_str.contains("beacon_id"));
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn test_zero_connect_timeout_is_invalid() {
        let mut cfg = AgentConfig::default();
        cfg.handshake.connect_timeout_ms = 0;

        let result = cfg.validate();

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "handshake.connect_timeout_ms", .. })
        ));
    }

    #[test]
    fn test_zero_capacity_is_invalid() {
        let mut cfg = AgentConfig::default();
        cfg.handshake.max_concurrent_peers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_handshake_config_carries_fixed_beacon_and_timing() {
        let mut cfg = AgentConfig::default();
        cfg.agent.beacon_id = Some(0xCAFE);
        cfg.agent.role = RolePreference::Controller;
        cfg.handshake.connect_timeout_ms = 1500;

        let hs = cfg.handshake_config();

        assert_eq!(hs.beacon_id, DeviceBeaconId(0xCAFE));
        assert_eq!(hs.role_preference, RolePreference::Controller);
        assert_eq!(hs.connect_timeout, Duration::from_millis(1500));
        assert_eq!(hs.max_concurrent_peers, 1);
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_load_config_from_missing_file_returns_default() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/config.toml");
        let cfg = load_config_from(&path).expect("missing file is not an error");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        // Arrange
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = AgentConfig::default();
        cfg.agent.device_name = "bench-tag".to_string();
        cfg.agent.beacon_id = Some(7);
        cfg.handshake.connect_retries = 3;

        // Act
        save_config(&cfg, &path).expect("save");
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_load_config_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[handshake]\nmax_concurrent_peers = 0\n").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
