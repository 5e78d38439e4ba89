//! Settings for the eqlink transport and its tools.
//!
//! Settings persist to disk as `config.ron`. CLI flags override loaded
//! values; sections missing from the file fall back to defaults.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    AuthConfig, CONFIG_FILE_NAME, Config, DebugConfig, NetworkConfig, ReconnectSettings,
    default_config_dir,
};
pub use error::ConfigError;
