//! Translation from persisted settings to transport configuration.

use std::path::PathBuf;

use eqlink_config::{CliArgs, Config, ConfigError};
use eqlink_net::{AuthOpcodes, ManagerConfig, NetConnectorConfig, ReconnectConfig};

/// Connection manager tunables from `config`.
pub fn manager_config(config: &Config) -> ManagerConfig {
    let reconnect = &config.reconnect;
    ManagerConfig {
        request_timeout: config.network.request_timeout(),
        reconnect: ReconnectConfig {
            enabled: reconnect.enabled,
            initial_delay: reconnect.base_delay(),
            max_delay: reconnect.max_delay(),
            max_attempts: reconnect.max_retries,
            jitter: reconnect.jitter.clamp(0.0, 1.0),
            ..ReconnectConfig::default()
        },
        max_stream_frame: config.network.max_stream_frame,
        read_buffer_size: config.network.read_buffer_size,
        debug_event_capacity: config.debug.event_capacity,
    }
}

/// Handshake settings from `config`.
pub fn connector_config(config: &Config) -> NetConnectorConfig {
    NetConnectorConfig {
        connect_timeout: config.network.connect_timeout(),
        max_datagram_size: config.network.max_datagram_size,
    }
}

/// Login opcodes from `config`.
pub fn auth_opcodes(config: &Config) -> AuthOpcodes {
    AuthOpcodes {
        login: config.auth.login_opcode,
        response: config.auth.response_opcode,
    }
}

/// The config file as last read, plus the CLI overrides layered on top.
///
/// Transport settings are fixed at startup, but the login section is
/// re-read before each login so a rotated token is picked up without a
/// restart.
pub struct LiveConfig {
    dir: PathBuf,
    file: Config,
    args: CliArgs,
}

impl LiveConfig {
    /// Track `file`, loaded from `dir`, with `args` applied on top.
    pub fn new(dir: PathBuf, file: Config, args: CliArgs) -> Self {
        Self { dir, file, args }
    }

    /// The effective config: file contents plus CLI overrides.
    pub fn effective(&self) -> Config {
        let mut config = self.file.clone();
        config.apply_cli_overrides(&self.args);
        config
    }

    /// Re-read the file and copy its login section into `config`.
    /// Returns whether the effective login settings changed.
    pub fn refresh_auth(&mut self, config: &mut Config) -> Result<bool, ConfigError> {
        let Some(file) = self.file.reload(&self.dir)? else {
            return Ok(false);
        };
        self.file = file;
        let auth = self.effective().auth;
        if auth == config.auth {
            return Ok(false);
        }
        config.auth = auth;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracked(dir: &std::path::Path, args: CliArgs) -> (LiveConfig, Config) {
        let file = Config::load_or_create(dir).unwrap();
        let live = LiveConfig::new(dir.to_path_buf(), file, args);
        let effective = live.effective();
        (live, effective)
    }

    #[test]
    fn test_rotated_token_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let (mut live, mut config) = tracked(dir.path(), CliArgs::default());
        assert!(!live.refresh_auth(&mut config).unwrap());

        let mut on_disk = Config::default();
        on_disk.auth.token = "rotated".to_string();
        on_disk.network.server_port = 9999;
        on_disk.save(dir.path()).unwrap();

        assert!(live.refresh_auth(&mut config).unwrap());
        assert_eq!(config.auth.token, "rotated");
        // Only the login section is applied while running.
        assert_eq!(config.network.server_port, 443);
    }

    #[test]
    fn test_cli_token_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = CliArgs {
            token: Some("from-cli".to_string()),
            ..Default::default()
        };
        let (mut live, mut config) = tracked(dir.path(), args);

        let mut on_disk = Config::default();
        on_disk.auth.token = "from-file".to_string();
        on_disk.save(dir.path()).unwrap();

        assert!(!live.refresh_auth(&mut config).unwrap());
        assert_eq!(config.auth.token, "from-cli");
    }

    #[test]
    fn test_unreadable_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut live, mut config) = tracked(dir.path(), CliArgs::default());
        std::fs::write(dir.path().join(eqlink_config::CONFIG_FILE_NAME), "(network: ").unwrap();
        assert!(live.refresh_auth(&mut config).is_err());
        assert_eq!(config.auth, Config::default().auth);
    }

    #[test]
    fn test_defaults_carry_over() {
        let manager = manager_config(&Config::default());
        let defaults = ManagerConfig::default();
        assert_eq!(manager.request_timeout, defaults.request_timeout);
        assert_eq!(manager.max_stream_frame, defaults.max_stream_frame);
        assert_eq!(manager.debug_event_capacity, defaults.debug_event_capacity);
        assert_eq!(manager.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(manager.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(manager.reconnect.max_attempts, 5);
        assert_eq!(manager.reconnect.backoff_multiplier, 2.0);

        let connector = connector_config(&Config::default());
        assert_eq!(connector.connect_timeout, Duration::from_secs(5));
        assert_eq!(connector.max_datagram_size, 1200);
        assert_eq!(auth_opcodes(&Config::default()), AuthOpcodes::default());
    }

    #[test]
    fn test_overrides_flow_through() {
        let mut config = Config::default();
        config.reconnect.enabled = false;
        config.reconnect.max_retries = 2;
        config.reconnect.jitter = 3.0;
        config.network.request_timeout_ms = 250;
        config.auth.login_opcode = 40;

        let manager = manager_config(&config);
        assert!(!manager.reconnect.enabled);
        assert_eq!(manager.reconnect.max_attempts, 2);
        assert_eq!(manager.reconnect.jitter, 1.0);
        assert_eq!(manager.request_timeout, Duration::from_millis(250));
        assert_eq!(auth_opcodes(&config).login, 40);
    }
}
