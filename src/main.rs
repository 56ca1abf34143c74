//! MRVPN backend service entry point
//!
//! Runs as a Windows service by default, with `-install` / `-uninstall` /
//! `-interactive` flags short-circuiting service dispatch.

use std::sync::Arc;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use mrvpn_core::ipc::Handler;
use mrvpn_core::utils;
use mrvpn_core::vpn::{Engine, StateMachine};

#[cfg(windows)]
use mrvpn_core::ipc::protocol::{Notification, StateChangedParams, StatsUpdateParams};
#[cfg(windows)]
use mrvpn_core::ipc::Server;
#[cfg(windows)]
use mrvpn_core::service;
#[cfg(windows)]
use mrvpn_core::vpn::State;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let has_flag = |flag: &str| args.iter().any(|a| a == flag);

    init_logging();

    #[cfg(windows)]
    {
        if has_flag("-install") {
            match service::install() {
                Ok(()) => {
                    info!("service installed");
                    println!("Service installed successfully. Start it with: net start MRVPN");
                }
                Err(e) => {
                    error!("failed to install service: {e}");
                    eprintln!("Failed to install service: {e}");
                    std::process::exit(1);
                }
            }
            return;
        }

        if has_flag("-uninstall") {
            match service::uninstall() {
                Ok(()) => {
                    info!("service uninstalled");
                    println!("Service uninstalled successfully.");
                }
                Err(e) => {
                    error!("failed to uninstall service: {e}");
                    eprintln!("Failed to uninstall service: {e}");
                    std::process::exit(1);
                }
            }
            return;
        }

        if has_flag("-interactive") {
            info!("running in interactive mode...");
            run_core(CancellationToken::new());
            return;
        }

        // Default: try to run as a Windows service, falling back to
        // interactive mode when the SCM did not start us.
        match service::run_as_service(run_core) {
            Ok(true) => {}
            Ok(false) => {
                info!("not running as service, starting in interactive mode...");
                info!("use -install to install as a Windows service");
                run_core(CancellationToken::new());
            }
            Err(e) => {
                error!("failed to run as service: {e}");
                std::process::exit(1);
            }
        }
    }

    #[cfg(not(windows))]
    {
        let _ = has_flag;
        info!("running in interactive mode...");
        run_core(CancellationToken::new());
    }
}

/// Set up file logging under the data directory, rotating oversized logs.
fn init_logging() {
    let log_dir = utils::data_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("service.log");

    if let Err(e) = utils::rotate_log_if_needed(&log_path) {
        eprintln!("Failed to rotate log: {e}");
    }

    let level = std::env::var("RUST_LOG")
        .map(|_| log::LevelFilter::Debug)
        .unwrap_or(log::LevelFilter::Info);

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(log_file) => {
            env_logger::Builder::from_default_env()
                .filter_level(level)
                .format_timestamp_millis()
                .target(env_logger::Target::Pipe(Box::new(log_file)))
                .init();
        }
        Err(_) => {
            // Fall back to stderr if file logging fails
            env_logger::Builder::from_default_env()
                .filter_level(level)
                .format_timestamp_millis()
                .init();
        }
    }

    info!("========================================");
    info!("starting MRVPN service v{}", env!("CARGO_PKG_VERSION"));
}

/// Boot the core and block until the stop token is cancelled (or Ctrl-C in
/// interactive mode).
fn run_core(stop: CancellationToken) {
    let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

    runtime.block_on(async {
        if !utils::is_administrator() {
            warn!("not running with administrator privileges; TUN setup may fail");
        }

        let state_machine = Arc::new(StateMachine::new());
        let engine = Arc::new(Engine::new(Arc::clone(&state_machine)));
        let handler = Arc::new(Handler::new(
            Arc::clone(&engine),
            Arc::clone(&state_machine),
            stop.clone(),
        ));

        #[cfg(windows)]
        let server = {
            let server = Arc::new(Server::new(handler));
            wire_notifications(&state_machine, &engine, &server);

            if let Err(e) = Arc::clone(&server).start() {
                error!("failed to start IPC server: {e}");
                return;
            }
            server
        };

        #[cfg(not(windows))]
        let _handler = handler;

        info!("MRVPN core service started");

        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
            }
        }

        info!("MRVPN core service stopping...");

        #[cfg(windows)]
        server.stop().await;

        if let Err(e) = engine.disconnect().await {
            warn!("disconnect during shutdown failed: {e}");
        }
    });
}

/// Forward state transitions and traffic stats to every connected UI.
#[cfg(windows)]
fn wire_notifications(state_machine: &Arc<StateMachine>, engine: &Arc<Engine>, server: &Arc<Server>) {
    {
        let server = Arc::clone(server);
        let engine = Arc::clone(engine);
        state_machine.on_state_change(move |state, err| {
            let server_name = if state == State::Connected {
                engine.snapshot().server_name
            } else {
                None
            };
            server.broadcast(&Notification::new(
                "vpn.stateChanged",
                StateChangedParams {
                    state: state.as_str().to_string(),
                    error: err
                        .as_deref()
                        .map(|e| mrvpn_core::ipc::handler::sanitize_error(e).to_string()),
                    server_name,
                },
            ));
        });
    }

    {
        let server = Arc::clone(server);
        state_machine.on_stats(move |upload, download, up_speed, down_speed| {
            server.broadcast(&Notification::new(
                "vpn.statsUpdate",
                StatsUpdateParams {
                    upload,
                    download,
                    up_speed,
                    down_speed,
                },
            ));
        });
    }
}
