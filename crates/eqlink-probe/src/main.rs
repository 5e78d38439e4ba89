//! Connects to a game server's world endpoint, optionally logs in, and
//! reports transport activity until interrupted or the session is given up.

mod events;
mod settings;

use std::process::ExitCode;

use clap::Parser;
use eqlink_config::{CliArgs, Config, default_config_dir};
use eqlink_net::{
    AuthError, ClientContext, ConnectionState, LoginResponse, RequestError, authenticate,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::settings::LiveConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let Some(dir) = args.config.clone().or_else(default_config_dir) else {
        eprintln!("Failed to load config: no config directory, pass --config");
        return ExitCode::FAILURE;
    };
    let file = match Config::load_or_create(&dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    let live = LiveConfig::new(dir, file, args);
    let config = live.effective();

    eqlink_log::init_logging(
        config.debug.log_dir.as_deref(),
        cfg!(debug_assertions),
        Some(&config),
    );

    run(config, live).await
}

async fn run(mut config: Config, mut live: LiveConfig) -> ExitCode {
    let context = ClientContext::new(
        settings::connector_config(&config),
        settings::manager_config(&config),
    );
    let world = context.world().clone();

    if config.debug.log_events {
        tokio::spawn(events::log_events(world.debug_events()));
    }

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let address = config.network.server_address.clone();
    let port = config.network.server_port;
    tracing::info!(%address, port, "connecting to world server");

    let connected = world
        .connect(address, port, move || {
            let _ = closed_tx.send(());
        })
        .await;
    if !connected {
        tracing::warn!("initial connect failed, retrying in the background");
    }

    let mut state = world.watch_state();
    state.mark_changed();
    let (login_tx, mut login_rx) = mpsc::unbounded_channel();
    let mut login: Option<JoinHandle<()>> = None;

    let code = loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break ExitCode::FAILURE;
                }
                if *state.borrow_and_update() != ConnectionState::Connected {
                    continue;
                }
                match live.refresh_auth(&mut config) {
                    Ok(true) => tracing::info!("login settings changed on disk"),
                    Ok(false) => {}
                    Err(error) => tracing::warn!(%error, "keeping previous login settings"),
                }
                if config.auth.token.is_empty() {
                    continue;
                }
                if let Some(stale) = login.take() {
                    stale.abort();
                }
                let world = world.clone();
                let opcodes = settings::auth_opcodes(&config);
                let token = config.auth.token.clone();
                let login_tx = login_tx.clone();
                login = Some(tokio::spawn(async move {
                    let _ = login_tx.send(authenticate(&world, opcodes, &token).await);
                }));
            }
            Some(result) = login_rx.recv() => {
                if after_login(&result) == AfterLogin::Exit {
                    break ExitCode::FAILURE;
                }
            }
            _ = closed_rx.recv() => {
                tracing::error!("world server unreachable, giving up");
                break ExitCode::FAILURE;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    tracing::error!(%error, "failed to listen for interrupt");
                }
                tracing::info!("interrupted");
                break ExitCode::SUCCESS;
            }
        }
    };

    if let Some(login) = login {
        login.abort();
    }
    context.close_all();
    let metrics = world.metrics();
    tracing::info!(?metrics, "final transport counters");
    code
}

#[derive(Debug, PartialEq, Eq)]
enum AfterLogin {
    Continue,
    Exit,
}

/// Log a login result and decide whether the probe keeps running.
///
/// A login cut short by a lost session is retried on the next transition
/// to `Connected`.
fn after_login(result: &Result<LoginResponse, AuthError>) -> AfterLogin {
    match result {
        Ok(response) => {
            tracing::info!(status = response.status, "logged in");
            AfterLogin::Continue
        }
        Err(AuthError::Request(RequestError::ConnectionLost | RequestError::NotConnected)) => {
            tracing::warn!("login interrupted by disconnect, retrying after reconnect");
            AfterLogin::Continue
        }
        Err(error) => {
            tracing::error!(%error, "login failed");
            AfterLogin::Exit
        }
    }
}
