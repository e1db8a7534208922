//! ArmDock Server
//!
//! Calibration and teleoperation control for robot arms.
//! Runs the external tool per session and streams state over WebSocket.

mod api;
mod calibration;
mod config;
mod effect;
mod error;
mod fanout;
mod fleet;
mod logging;
mod orchestrator;
mod paths;
mod presence;
mod session;
mod session_actor;
mod session_command;
mod state;
mod store;
mod teleop;
mod websocket;

use std::sync::Arc;

use armdock_connectors::{DeviceSource, SerialPortScanner};
use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Cli, Commands, ServerConfig};
use crate::paths::DataPaths;
use crate::state::AppState;
use crate::store::JsonRobotStore;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ports => print_ports(),
        Commands::Serve => serve(cli).await,
    }
}

fn print_ports() -> anyhow::Result<()> {
    let devices = SerialPortScanner::default().list_attached_devices()?;
    if devices.is_empty() {
        println!("No serial devices attached");
        return Ok(());
    }
    let width = devices.keys().map(|port| port.len()).max().unwrap_or(0);
    for (port, description) in &devices {
        println!("{port:<width$}  {description}");
    }
    Ok(())
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    paths.ensure_dirs()?;
    let logging = logging::init_logging(&paths.log_dir())?;

    let config = ServerConfig::resolve(&cli)?;
    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths.root().display(),
        dry_run = config.dry_run,
        tool_available = config.tool.available,
        python = %config.tool.python.display(),
        "Starting ArmDock server"
    );

    let store = JsonRobotStore::open(paths.robots_path())?;
    let state = Arc::new(AppState::new(
        config,
        Arc::new(store),
        Arc::new(SerialPortScanner::default()),
    )?);

    presence::tick(&state).await;
    let poller = presence::spawn_presence_loop(state.clone());

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .merge(api::routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state.clone());

    let addr = state.config.bind;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %addr,
        "Listening on {addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    poller.abort();
    state.registry.shutdown().await;
    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(
                component = "server",
                event = "server.signal_failed",
                error = %e,
                "Failed to listen for Ctrl+C"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown requested"
    );
}
