use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beach_pier_core::{HandshakeError, RelayConfig, RelayProxy};
use clap::Parser;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod asr;
mod config;
mod pty;
mod telemetry;
mod terminal;
mod ws;

use config::{Cli, ServerConfig};
use terminal::ConnectionGate;
use ws::TungsteniteDialer;

struct AppState {
    config: ServerConfig,
    metrics: PrometheusHandle,
    gate: ConnectionGate,
    relay: Option<RelayProxy<TungsteniteDialer>>,
    hostname: String,
    shutdown: CancellationToken,
}

impl AppState {
    fn new(config: ServerConfig, metrics: PrometheusHandle, shutdown: CancellationToken) -> Self {
        let relay = config.asr.as_ref().map(|asr| {
            RelayProxy::new(
                TungsteniteDialer::new(asr.backend.clone()),
                RelayConfig::new(asr.credential.clone())
                    .with_handshake_timeout(config.handshake_timeout)
                    .with_grace(asr.grace),
            )
        });
        let gate = ConnectionGate::new(config.terminal.max_connection, config.terminal.once);
        Self {
            config,
            metrics,
            gate,
            relay,
            hostname: terminal::hostname(),
            shutdown,
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        command = ?config.terminal.command,
        permit_write = config.terminal.permit_write,
        asr_enabled = config.asr.is_some(),
        "starting beach-pier"
    );

    run(config, telemetry.metrics_handle()).await
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(terminal::ws_handler))
        .route("/asr/ws", get(asr::ws_handler))
        .with_state(state)
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let listen_addr = config.listen_addr;
    let shutdown_grace = config.shutdown_grace;
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(config, metrics, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-pier listening on {}", listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

/// Resolves on Ctrl-C or when a session requests shutdown, and tells every running
/// session to stop.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

fn record_handshake_failure(endpoint: &'static str, error: &HandshakeError) {
    counter!(
        "beach_pier_handshake_failures_total",
        1,
        "endpoint" => endpoint,
        "reason" => error.metric_label()
    );
}

#[cfg(test)]
mod test_support {
    use std::net::SocketAddr;
    use std::time::Duration;

    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::config::TerminalConfig;

    pub fn terminal_config(command: &[&str]) -> TerminalConfig {
        TerminalConfig {
            command: command.iter().map(|arg| arg.to_string()).collect(),
            permit_write: false,
            credential: None,
            permit_arguments: false,
            title_format: beach_pier_core::DEFAULT_TITLE_FORMAT.to_string(),
            preferences: None,
            reconnect: None,
            width: 0,
            height: 0,
            buffer_size: beach_pier_core::DEFAULT_BUFFER_SIZE,
            max_connection: 0,
            once: false,
        }
    }

    pub fn server_config(terminal: TerminalConfig) -> ServerConfig {
        ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            terminal,
            asr: None,
            handshake_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::ZERO,
        }
    }

    /// Serves the router on an ephemeral port until the returned token is cancelled.
    pub async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
        let metrics = PrometheusBuilder::new().build_recorder().handle();
        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState::new(config, metrics, shutdown.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
        (addr, state)
    }
}
