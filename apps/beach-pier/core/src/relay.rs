//! Authenticated, message-preserving relay between a client connection and a backend.
//!
//! The client must open with a JSON text message carrying the shared token. After that
//! the proxy dials the backend once and pumps messages unmodified in both directions
//! until either side fails or the caller cancels. Connections are closed by the caller.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{InitMessage, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE: Duration = Duration::from_millis(50);
pub const BACKEND_UNAVAILABLE_REASON: &str = "ASR backend unavailable";

/// One data message as it travels across the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RelayFrame {
    pub fn len(&self) -> usize {
        match self {
            RelayFrame::Text(text) => text.len(),
            RelayFrame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            RelayFrame::Text(text) => text.into_bytes(),
            RelayFrame::Binary(bytes) => bytes,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayIoError {
    #[error("peer closed the connection{}", close_suffix(.0))]
    Closed(Option<String>),
    #[error("transport error: {0}")]
    Transport(String),
}

fn close_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|reason| format!(": {reason}"))
        .unwrap_or_default()
}

/// Reading half of a message connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next data message. Control frames are handled by the implementation; a close
    /// frame surfaces as [`RelayIoError::Closed`].
    async fn recv(&mut self) -> Result<RelayFrame, RelayIoError>;
}

/// Writing half of a message connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: RelayFrame) -> Result<(), RelayIoError>;

    /// Sends a close frame with `code` and `reason`.
    async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), RelayIoError>;
}

/// Opens a fresh backend connection for each relayed client.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    type Source: FrameSource;
    type Sink: FrameSink;

    async fn dial(&self) -> Result<(Self::Source, Self::Sink), RelayIoError>;
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("failed to read init message: {0}")]
    Read(#[source] RelayIoError),
    #[error("invalid init message type")]
    InvalidMessageType,
    #[error("failed to parse init message: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    #[error("authentication failed")]
    AuthenticationFailed,
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::Read(_) => "read_failed",
            HandshakeError::InvalidMessageType => "invalid_type",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::AuthenticationFailed => "auth_failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("backend dial failed: {0}")]
    BackendUnavailable(#[source] RelayIoError),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub credential: String,
    pub handshake_timeout: Duration,
    pub grace: Duration,
}

impl RelayConfig {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpStop {
    /// Still running when the grace period expired.
    Abandoned,
    /// The shared stop signal fired.
    Stopped,
    ReadFailed(String),
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpStats {
    pub direction: Direction,
    pub messages: u64,
    pub bytes: u64,
    pub stop: PumpStop,
}

impl PumpStats {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            messages: 0,
            bytes: 0,
            stop: PumpStop::Abandoned,
        }
    }

    fn failed(&self) -> bool {
        matches!(self.stop, PumpStop::ReadFailed(_) | PumpStop::WriteFailed(_))
    }

    /// The pump returned on its own instead of being dropped after the grace period.
    pub fn exited(&self) -> bool {
        self.stop != PumpStop::Abandoned
    }
}

/// Outcome of one relayed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub client_to_backend: PumpStats,
    pub backend_to_client: PumpStats,
    /// Number of pumps that exited within the grace period.
    pub completed: usize,
    /// The caller's token fired before either pump failed.
    pub cancelled: bool,
}

impl RelayReport {
    /// Direction whose failure ended the session, if one did.
    pub fn initiator(&self) -> Option<Direction> {
        [&self.client_to_backend, &self.backend_to_client]
            .into_iter()
            .find(|stats| stats.failed())
            .map(|stats| stats.direction)
    }
}

pub struct RelayProxy<D> {
    dialer: D,
    config: RelayConfig,
}

impl<D: BackendDialer> RelayProxy<D> {
    pub fn new(dialer: D, config: RelayConfig) -> Self {
        Self { dialer, config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Authenticates the client, dials the backend and relays until either side stops.
    ///
    /// On handshake failure the client receives a policy-violation close frame; when the
    /// backend cannot be reached it receives try-again-later. Neither connection is
    /// dropped here, closing them stays with the caller.
    pub async fn serve<CS, CK>(
        &self,
        client_rx: &mut CS,
        client_tx: &mut CK,
        cancel: CancellationToken,
    ) -> Result<RelayReport, RelayError>
    where
        CS: FrameSource,
        CK: FrameSink,
    {
        if let Err(err) = authenticate(
            client_rx,
            &self.config.credential,
            self.config.handshake_timeout,
        )
        .await
        {
            let _ = client_tx
                .close_with(CLOSE_POLICY_VIOLATION, &err.to_string())
                .await;
            return Err(err.into());
        }

        let (mut backend_rx, mut backend_tx) = match self.dialer.dial().await {
            Ok(backend) => backend,
            Err(err) => {
                let _ = client_tx
                    .close_with(CLOSE_TRY_AGAIN_LATER, BACKEND_UNAVAILABLE_REASON)
                    .await;
                return Err(RelayError::BackendUnavailable(err));
            }
        };

        Ok(relay(
            client_rx,
            client_tx,
            &mut backend_rx,
            &mut backend_tx,
            cancel,
            self.config.grace,
        )
        .await)
    }
}

/// Reads exactly one message and parses it as an [`InitMessage`].
pub async fn read_init<S: FrameSource>(
    source: &mut S,
    timeout: Duration,
) -> Result<InitMessage, HandshakeError> {
    let frame = tokio::time::timeout(timeout, source.recv())
        .await
        .map_err(|_| HandshakeError::TimedOut)?
        .map_err(HandshakeError::Read)?;

    let RelayFrame::Text(text) = frame else {
        return Err(HandshakeError::InvalidMessageType);
    };
    serde_json::from_str(&text).map_err(HandshakeError::InvalidPayload)
}

/// Reads the init message and checks it carries `credential`.
pub async fn authenticate<S: FrameSource>(
    source: &mut S,
    credential: &str,
    timeout: Duration,
) -> Result<InitMessage, HandshakeError> {
    let init = read_init(source, timeout).await?;
    if init.auth_token != credential {
        return Err(HandshakeError::AuthenticationFailed);
    }
    Ok(init)
}

/// Pumps messages both ways until a pump fails or `cancel` fires, then waits up to
/// `grace` for both pumps to exit.
pub async fn relay<CS, CK, BS, BK>(
    client_rx: &mut CS,
    client_tx: &mut CK,
    backend_rx: &mut BS,
    backend_tx: &mut BK,
    cancel: CancellationToken,
    grace: Duration,
) -> RelayReport
where
    CS: FrameSource,
    CK: FrameSink,
    BS: FrameSource,
    BK: FrameSink,
{
    let stop = cancel.child_token();
    let mut upstream = PumpStats::new(Direction::ClientToBackend);
    let mut downstream = PumpStats::new(Direction::BackendToClient);

    {
        let both = async {
            tokio::join!(
                pump(client_rx, backend_tx, &stop, &mut upstream),
                pump(backend_rx, client_tx, &stop, &mut downstream),
            );
        };
        tokio::pin!(both);

        let finished = tokio::select! {
            _ = &mut both => true,
            _ = stop.cancelled() => false,
        };
        if !finished {
            let _ = tokio::time::timeout(grace, &mut both).await;
        }
    }
    let completed = [&upstream, &downstream]
        .into_iter()
        .filter(|stats| stats.exited())
        .count();

    let report = RelayReport {
        cancelled: cancel.is_cancelled() && !upstream.failed() && !downstream.failed(),
        client_to_backend: upstream,
        backend_to_client: downstream,
        completed,
    };
    debug!(
        completed = report.completed,
        cancelled = report.cancelled,
        initiator = report.initiator().map(Direction::label),
        "relay finished"
    );
    report
}

async fn pump<S: FrameSource, K: FrameSink>(
    source: &mut S,
    sink: &mut K,
    stop: &CancellationToken,
    stats: &mut PumpStats,
) {
    stats.stop = loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break PumpStop::Stopped,
            frame = source.recv() => match frame {
                Ok(frame) => frame,
                Err(err) => break PumpStop::ReadFailed(err.to_string()),
            },
        };

        let len = frame.len() as u64;
        tokio::select! {
            _ = stop.cancelled() => break PumpStop::Stopped,
            sent = sink.send(frame) => {
                if let Err(err) = sent {
                    break PumpStop::WriteFailed(err.to_string());
                }
            }
        }
        stats.messages += 1;
        stats.bytes += len;
    };
    stop.cancel();
}
