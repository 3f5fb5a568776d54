//! `/asr/ws`: authenticated pass-through to the streaming transcription backend.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use beach_pier_core::{FrameSink, PumpStats, RelayError, RelayReport};
use metrics::counter;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ws::split_socket;
use crate::AppState;

const CLOSE_NORMAL: u16 = 1000;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if state.relay.is_none() {
        return (StatusCode::NOT_FOUND, "ASR is disabled").into_response();
    }
    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| handle_connection(socket, state))
            .into_response(),
        None => (StatusCode::BAD_REQUEST, "expected a WebSocket upgrade").into_response(),
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let Some(proxy) = state.relay.as_ref() else {
        return;
    };
    let connection_id = Uuid::new_v4();
    let (mut source, mut sink) = split_socket(socket);
    counter!("beach_pier_relay_sessions_total", 1);

    match proxy
        .serve(&mut source, &mut sink, state.shutdown.child_token())
        .await
    {
        Ok(report) => {
            record_report(&report);
            let _ = sink.close_with(CLOSE_NORMAL, "").await;
            info!(
                connection_id = %connection_id,
                initiator = report.initiator().map(|direction| direction.label()),
                cancelled = report.cancelled,
                upstream_bytes = report.client_to_backend.bytes,
                downstream_bytes = report.backend_to_client.bytes,
                "relay session closed"
            );
        }
        Err(RelayError::Handshake(err)) => {
            crate::record_handshake_failure("asr", &err);
            warn!(connection_id = %connection_id, error = %err, "relay handshake failed");
        }
        Err(err @ RelayError::BackendUnavailable(_)) => {
            counter!("beach_pier_relay_backend_failures_total", 1);
            warn!(connection_id = %connection_id, error = %err, "ASR backend dial failed");
        }
    }
}

fn record_report(report: &RelayReport) {
    for stats in [&report.client_to_backend, &report.backend_to_client] {
        record_pump(stats);
    }
}

fn record_pump(stats: &PumpStats) {
    let direction = stats.direction.label();
    counter!(
        "beach_pier_relay_messages_forwarded_total",
        stats.messages,
        "direction" => direction
    );
    counter!(
        "beach_pier_relay_bytes_forwarded_total",
        stats.bytes,
        "direction" => direction
    );
}
