//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted config inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

/// Platform config directory for eqlink (`~/.config/eqlink` on Linux).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("eqlink"))
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server endpoint and transport limits.
    pub network: NetworkConfig,
    /// Reconnection policy.
    pub reconnect: ReconnectSettings,
    /// Login exchange.
    pub auth: AuthConfig,
    /// Logging and diagnostics.
    pub debug: DebugConfig,
}

/// Server endpoint and transport limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server host name or address.
    pub server_address: String,
    /// Server port (shared by the stream and datagram channels).
    pub server_port: u16,
    /// Deadline for each request/response pair, in milliseconds.
    pub request_timeout_ms: u64,
    /// Deadline for the whole handshake, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Largest datagram sent on the unreliable channel.
    pub max_datagram_size: usize,
    /// Largest accepted stream frame.
    pub max_stream_frame: u32,
    /// Size of the stream read buffer.
    pub read_buffer_size: usize,
}

/// Reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Re-establish lost sessions.
    pub enabled: bool,
    /// Attempts before giving up.
    pub max_retries: u32,
    /// Delay before the first attempt, in milliseconds. Doubles per attempt.
    pub base_delay_ms: u64,
    /// Upper bound on the delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Random spread applied to each delay (0.0 - 1.0).
    pub jitter: f64,
}

/// Login exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Token sent after connecting. Empty skips the login.
    pub token: String,
    /// Opcode of the login request.
    pub login_opcode: u16,
    /// Opcode of the login response.
    pub response_opcode: u16,
}

/// Logging and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for JSON log files in debug builds.
    pub log_dir: Option<PathBuf>,
    /// Debug events buffered per subscriber.
    pub event_capacity: usize,
    /// Log every debug event (sends, receives, state changes).
    pub log_events: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 443,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            max_datagram_size: 1200,
            max_stream_frame: 16 * 1024 * 1024,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            login_opcode: 1,
            response_opcode: 2,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            event_capacity: 200,
            log_events: false,
        }
    }
}

// --- Durations ---

impl NetworkConfig {
    /// Request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Handshake deadline as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ReconnectSettings {
    /// First backoff delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff cap as a [`Duration`].
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }
        let config = read_config(&path)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write `config.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty)?;

        let path = config_dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, text).map_err(|source| ConfigError::Write { path, source })
    }

    /// Re-read `config.ron`. Returns the file's contents only when they
    /// differ from `self`, so callers can skip work on an unchanged file.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let current = read_config(&config_dir.join(CONFIG_FILE_NAME))?;
        if current == *self {
            return Ok(None);
        }
        log::info!("Config file changed on disk");
        Ok(Some(current))
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_transport_defaults() {
        let config = Config::default();
        assert_eq!(config.network.server_address, "127.0.0.1");
        assert_eq!(config.network.server_port, 443);
        assert_eq!(config.network.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.network.max_stream_frame, 16 * 1024 * 1024);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect.base_delay(), Duration::from_secs(1));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(30));
        assert_eq!(config.reconnect.jitter, 0.0);
        assert_eq!(config.debug.event_capacity, 200);
    }

    #[test]
    fn test_default_config_serializes() {
        let pretty = ron::ser::PrettyConfig::new().depth_limit(3);
        let ron_str = ron::ser::to_string_pretty(&Config::default(), pretty).unwrap();
        assert!(ron_str.contains("server_port: 443"));
        assert!(ron_str.contains("max_retries: 5"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.debug.log_dir = Some(PathBuf::from("/tmp/eqlink-logs"));
        config.auth.token = "local".to_string();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (server_port: 9000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.server_port, 9000);
        assert_eq!(config.network.server_address, "127.0.0.1");
        assert_eq!(config.reconnect, ReconnectSettings::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_address = "10.0.0.1".to_string();
        config.reconnect.max_retries = 8;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("eqlink");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.network.server_port = 7000;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().network.server_port, 7000);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        match result {
            Err(ConfigError::Parse { path, .. }) => {
                assert_eq!(path, dir.path().join(CONFIG_FILE_NAME));
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_reload_of_missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::default().reload(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }
}
