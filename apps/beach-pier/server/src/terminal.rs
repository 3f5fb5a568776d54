//! `/ws`: one PTY command per connected client, bridged over the terminal protocol.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use beach_pier_core::{
    read_init, render_title, Bridge, BridgeError, BridgeOptions, FrameSink, HandshakeError,
    InitMessage, SessionEnd, Slave, TitleVariables, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER,
};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pty::PtySlave;
use crate::ws::{split_socket, FramedMaster};
use crate::AppState;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

const DEFAULT_COLUMNS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Error)]
enum TerminalError {
    #[error("connection rejected: {0}")]
    Rejected(&'static str),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("failed to start command: {0:#}")]
    Spawn(anyhow::Error),
    #[error("session failed: {0}")]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Full,
    AlreadyServed,
}

impl Rejection {
    fn reason(self) -> &'static str {
        match self {
            Rejection::Full => "too many connections",
            Rejection::AlreadyServed => "server accepts a single client",
        }
    }

    fn metric_label(self) -> &'static str {
        match self {
            Rejection::Full => "max_connection",
            Rejection::AlreadyServed => "once",
        }
    }
}

/// Admission control for terminal clients: an optional concurrency cap and single-use mode.
pub struct ConnectionGate {
    max: usize,
    once: bool,
    active: AtomicUsize,
    served: AtomicBool,
}

/// Holds one slot of the gate until dropped.
pub struct ConnectionPermit<'a> {
    gate: &'a ConnectionGate,
}

impl ConnectionGate {
    pub fn new(max: usize, once: bool) -> Self {
        Self {
            max,
            once,
            active: AtomicUsize::new(0),
            served: AtomicBool::new(false),
        }
    }

    pub fn try_acquire(&self) -> Result<ConnectionPermit<'_>, Rejection> {
        if self.once && self.served.swap(true, Ordering::SeqCst) {
            return Err(Rejection::AlreadyServed);
        }
        let previous = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (self.max == 0 || active < self.max).then_some(active + 1)
            })
            .map_err(|_| Rejection::Full)?;
        gauge!("beach_pier_terminal_sessions_active", (previous + 1) as f64);
        Ok(ConnectionPermit { gate: self })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionPermit<'_> {
    fn drop(&mut self) {
        let previous = self.gate.active.fetch_sub(1, Ordering::SeqCst);
        gauge!(
            "beach_pier_terminal_sessions_active",
            previous.saturating_sub(1) as f64
        );
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    if let Err(err) = serve_terminal(socket, &state, connection_id).await {
        warn!(connection_id = %connection_id, error = %err, "terminal connection ended with error");
    }
    if state.config.terminal.once {
        info!("single client served; shutting down");
        state.shutdown.cancel();
    }
}

async fn serve_terminal(
    socket: WebSocket,
    state: &AppState,
    connection_id: Uuid,
) -> Result<(), TerminalError> {
    let terminal = &state.config.terminal;
    let (mut source, mut sink) = split_socket(socket);

    let _permit = match state.gate.try_acquire() {
        Ok(permit) => permit,
        Err(rejection) => {
            counter!(
                "beach_pier_terminal_rejected_total",
                1,
                "reason" => rejection.metric_label()
            );
            let _ = sink
                .close_with(CLOSE_TRY_AGAIN_LATER, rejection.reason())
                .await;
            return Err(TerminalError::Rejected(rejection.reason()));
        }
    };

    let init = match read_init(&mut source, state.config.handshake_timeout)
        .await
        .and_then(|init| check_credential(terminal.credential.as_deref(), init))
    {
        Ok(init) => init,
        Err(err) => {
            crate::record_handshake_failure("terminal", &err);
            let _ = sink.close_with(CLOSE_POLICY_VIOLATION, &err.to_string()).await;
            return Err(err.into());
        }
    };

    let mut command = terminal.command.clone();
    if terminal.permit_arguments {
        command.extend(parse_arguments(&init.arguments));
    }

    let slave = match PtySlave::spawn(
        &command,
        nonzero_or(terminal.width, DEFAULT_COLUMNS),
        nonzero_or(terminal.height, DEFAULT_ROWS),
    ) {
        Ok(slave) => Arc::new(slave),
        Err(err) => {
            let _ = sink
                .close_with(CLOSE_INTERNAL_ERROR, "failed to start command")
                .await;
            return Err(TerminalError::Spawn(err));
        }
    };

    let title = window_title(
        &terminal.title_format,
        slave.window_title_variables(),
        &state.hostname,
    );
    let mut options = BridgeOptions::new()
        .with_permit_write(terminal.permit_write)
        .with_fixed_size(terminal.width, terminal.height)
        .with_reconnect(terminal.reconnect.unwrap_or(0))
        .with_window_title(title)
        .with_buffer_size(terminal.buffer_size);
    if let Some(preferences) = &terminal.preferences {
        options = options.with_master_preferences(preferences.as_bytes());
    }

    let master = Arc::new(FramedMaster::new(source, sink));
    counter!("beach_pier_terminal_sessions_total", 1);
    info!(
        connection_id = %connection_id,
        command = ?command,
        active = state.gate.active(),
        "terminal session started"
    );

    let started = Instant::now();
    let mut bridge = Bridge::new(master.clone(), slave.clone(), options);
    let outcome = bridge.run(state.shutdown.child_token()).await;
    bridge.close();
    slave.terminate().await;
    histogram!(
        "beach_pier_terminal_session_duration_seconds",
        started.elapsed().as_secs_f64()
    );

    let (code, reason, label) = match &outcome {
        Ok(SessionEnd::SlaveClosed) => (CLOSE_NORMAL, String::new(), "slave_closed"),
        Ok(SessionEnd::MasterClosed) => (CLOSE_NORMAL, String::new(), "master_closed"),
        Ok(SessionEnd::Cancelled) => (CLOSE_GOING_AWAY, "server shutting down".to_string(), "cancelled"),
        Err(err) => (error_close_code(err), err.to_string(), "error"),
    };
    counter!("beach_pier_terminal_sessions_ended_total", 1, "reason" => label);
    master.close(code, &reason).await;

    let end = outcome?;
    info!(connection_id = %connection_id, end = ?end, "terminal session closed");
    Ok(())
}

fn error_close_code(err: &BridgeError) -> u16 {
    if err.is_io() {
        CLOSE_INTERNAL_ERROR
    } else {
        CLOSE_POLICY_VIOLATION
    }
}

fn check_credential(
    credential: Option<&str>,
    init: InitMessage,
) -> Result<InitMessage, HandshakeError> {
    match credential {
        Some(expected) if init.auth_token != expected => Err(HandshakeError::AuthenticationFailed),
        _ => Ok(init),
    }
}

/// Extracts `arg` values from a URL query string, in order.
fn parse_arguments(query: &str) -> Vec<String> {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .filter(|(key, _)| key == "arg")
        .map(|(_, value)| value.into_owned())
        .collect()
}

fn nonzero_or(value: u16, fallback: u16) -> u16 {
    if value == 0 {
        fallback
    } else {
        value
    }
}

fn window_title(format: &str, mut variables: TitleVariables, hostname: &str) -> String {
    variables.insert("hostname".into(), json!(hostname));
    render_title(format, &variables).unwrap_or_else(|err| {
        warn!(error = %err, "failed to render window title");
        String::new()
    })
}

pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{server_config, spawn_server, terminal_config};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use beach_pier_core::UploadError;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn arguments_come_from_repeated_arg_keys() {
        assert_eq!(
            parse_arguments("?arg=-l&x=1&arg=%2Ftmp%20dir"),
            vec!["-l".to_string(), "/tmp dir".to_string()]
        );
        assert!(parse_arguments("").is_empty());
    }

    #[test]
    fn io_failures_close_as_internal_errors() {
        let broken = || std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(
            error_close_code(&BridgeError::MasterWrite(broken())),
            CLOSE_INTERNAL_ERROR
        );
        assert_eq!(
            error_close_code(&BridgeError::SlaveWrite(broken())),
            CLOSE_INTERNAL_ERROR
        );
        assert_eq!(
            error_close_code(&BridgeError::Upload(UploadError::Write(broken()))),
            CLOSE_INTERNAL_ERROR
        );
        assert_eq!(
            error_close_code(&BridgeError::UnknownMessageType('z')),
            CLOSE_POLICY_VIOLATION
        );
        assert_eq!(error_close_code(&BridgeError::EmptyMessage), CLOSE_POLICY_VIOLATION);
        assert_eq!(
            error_close_code(&BridgeError::Upload(UploadError::OutOfOrder {
                expected: 1,
                got: 3
            })),
            CLOSE_POLICY_VIOLATION
        );
    }

    #[test]
    fn gate_enforces_limit_and_releases_on_drop() {
        let gate = ConnectionGate::new(1, false);
        let first = gate.try_acquire().expect("first slot");
        assert_eq!(gate.try_acquire().err(), Some(Rejection::Full));
        drop(first);
        assert_eq!(gate.active(), 0);
        assert!(gate.try_acquire().is_ok());

        let unlimited = ConnectionGate::new(0, false);
        let permits: Vec<_> = (0..16).map(|_| unlimited.try_acquire().expect("slot")).collect();
        assert_eq!(unlimited.active(), permits.len());
    }

    #[test]
    fn once_gate_admits_a_single_client_ever() {
        let gate = ConnectionGate::new(0, true);
        drop(gate.try_acquire().expect("first client"));
        assert_eq!(gate.try_acquire().err(), Some(Rejection::AlreadyServed));
    }

    #[test]
    fn credential_is_optional() {
        let init = InitMessage {
            auth_token: "guess".into(),
            arguments: String::new(),
        };
        assert!(check_credential(None, init.clone()).is_ok());
        assert!(matches!(
            check_credential(Some("secret"), init),
            Err(HandshakeError::AuthenticationFailed)
        ));
    }

    #[test]
    fn title_includes_server_hostname() {
        let mut vars = TitleVariables::new();
        vars.insert("command".into(), json!("htop"));
        assert_eq!(
            window_title("{{ .command }}@{{ .hostname }}", vars, "dune"),
            "htop@dune"
        );
    }

    #[test_timeout::tokio_timeout_test(secs = 15, worker_threads = 2)]
    async fn websocket_client_sees_init_sequence_and_command_output() {
        let mut terminal = terminal_config(&["sh", "-c", "echo pier-$0; sleep 2"]);
        terminal.permit_arguments = true;
        terminal.reconnect = Some(7);
        let (addr, state) = spawn_server(server_config(terminal)).await;

        let (mut socket, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
        socket
            .send(Message::Text(
                r#"{"AuthToken":"","Arguments":"arg=online"}"#.into(),
            ))
            .await
            .expect("init");

        let mut texts = Vec::new();
        let mut output = Vec::new();
        while !String::from_utf8_lossy(&output).contains("pier-online") {
            match socket.next().await.expect("message").expect("frame") {
                Message::Text(text) => {
                    if let Some(encoded) = text.strip_prefix('1') {
                        output.extend(STANDARD.decode(encoded).expect("base64 output"));
                    } else {
                        texts.push(text);
                    }
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }

        assert!(texts[0].starts_with("3sh@"), "title: {}", texts[0]);
        assert_eq!(texts[1], "61024");
        assert_eq!(texts[2], "57");

        drop(socket);
        state.shutdown.cancel();
    }

    #[test_timeout::tokio_timeout_test(secs = 10)]
    async fn wrong_credential_is_closed_with_policy_violation() {
        let mut terminal = terminal_config(&["sh"]);
        terminal.credential = Some("secret".into());
        let (addr, state) = spawn_server(server_config(terminal)).await;

        let (mut socket, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
        socket
            .send(Message::Text(r#"{"AuthToken":"nope"}"#.into()))
            .await
            .expect("init");

        match socket.next().await.expect("close").expect("frame") {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_POLICY_VIOLATION);
                assert_eq!(frame.reason, "authentication failed");
            }
            other => panic!("expected close, got {other:?}"),
        }
        state.shutdown.cancel();
    }
}
