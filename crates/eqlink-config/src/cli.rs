//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// eqlink command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "eqlink-probe", about = "Connect to a game server and watch the transport")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Login token; when set, the probe authenticates after connecting.
    #[arg(long)]
    pub token: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Reconnect attempts before giving up.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Do not reconnect after the session is lost.
    #[arg(long)]
    pub no_reconnect: bool,

    /// Log every debug event.
    #[arg(long)]
    pub log_events: bool,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(ref token) = args.token {
            self.auth.token = token.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(retries) = args.max_retries {
            self.reconnect.max_retries = retries;
        }
        if args.no_reconnect {
            self.reconnect.enabled = false;
        }
        if args.log_events {
            self.debug.log_events = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            server: Some("192.168.1.1".to_string()),
            token: Some("local".to_string()),
            max_retries: Some(2),
            no_reconnect: true,
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.server_address, "192.168.1.1");
        assert_eq!(config.auth.token, "local");
        assert_eq!(config.reconnect.max_retries, 2);
        assert!(!config.reconnect.enabled);
        // Non-overridden fields retain defaults
        assert_eq!(config.network.server_port, 443);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "eqlink-probe",
            "--server",
            "world.example",
            "--port",
            "7000",
            "--log-level",
            "debug",
            "--log-events",
        ]);
        assert_eq!(args.server.as_deref(), Some("world.example"));
        assert_eq!(args.port, Some(7000));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.log_events);
        assert!(!args.no_reconnect);
    }

    #[test]
    fn test_overrides_survive_ron_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs {
            port: Some(9000),
            log_level: Some("trace".to_string()),
            ..Default::default()
        });
        config.save(dir.path()).unwrap();

        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded.network.server_port, 9000);
        assert_eq!(loaded.debug.log_level, "trace");
    }
}
