//! WebSocket adapters: axum sockets for clients, tungstenite sockets for the relay
//! backend, and a [`Master`] built from any frame source/sink pair.

use std::borrow::Cow;
use std::io;

use async_trait::async_trait;
use axum::extract::ws::{self, WebSocket};
use beach_pier_core::{BackendDialer, FrameSink, FrameSource, Master, RelayFrame, RelayIoError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Close frame reasons must fit a 125 byte control payload after the status code.
const MAX_CLOSE_REASON: usize = 123;

pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

fn transport(err: impl std::fmt::Display) -> RelayIoError {
    RelayIoError::Transport(err.to_string())
}

pub struct AxumSource(SplitStream<WebSocket>);

pub struct AxumSink(SplitSink<WebSocket, ws::Message>);

/// Splits an upgraded client socket into relay halves.
pub fn split_socket(socket: WebSocket) -> (AxumSource, AxumSink) {
    let (tx, rx) = socket.split();
    (AxumSource(rx), AxumSink(tx))
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Result<RelayFrame, RelayIoError> {
        loop {
            match self.0.next().await {
                Some(Ok(ws::Message::Text(text))) => return Ok(RelayFrame::Text(text)),
                Some(Ok(ws::Message::Binary(bytes))) => return Ok(RelayFrame::Binary(bytes)),
                Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => continue,
                Some(Ok(ws::Message::Close(frame))) => {
                    return Err(RelayIoError::Closed(
                        frame.map(|frame| frame.reason.into_owned()),
                    ))
                }
                Some(Err(err)) => return Err(transport(err)),
                None => return Err(RelayIoError::Closed(None)),
            }
        }
    }
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: RelayFrame) -> Result<(), RelayIoError> {
        let message = match frame {
            RelayFrame::Text(text) => ws::Message::Text(text),
            RelayFrame::Binary(bytes) => ws::Message::Binary(bytes),
        };
        self.0.send(message).await.map_err(transport)
    }

    async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), RelayIoError> {
        let frame = ws::CloseFrame {
            code,
            reason: Cow::Owned(truncate_reason(reason)),
        };
        self.0
            .send(ws::Message::Close(Some(frame)))
            .await
            .map_err(transport)
    }
}

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TungsteniteSource(SplitStream<BackendStream>);

pub struct TungsteniteSink(SplitSink<BackendStream, tungstenite::Message>);

#[async_trait]
impl FrameSource for TungsteniteSource {
    async fn recv(&mut self) -> Result<RelayFrame, RelayIoError> {
        loop {
            match self.0.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => return Ok(RelayFrame::Text(text)),
                Some(Ok(tungstenite::Message::Binary(bytes))) => {
                    return Ok(RelayFrame::Binary(bytes))
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    return Err(RelayIoError::Closed(
                        frame.map(|frame| frame.reason.into_owned()),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(transport(err)),
                None => return Err(RelayIoError::Closed(None)),
            }
        }
    }
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: RelayFrame) -> Result<(), RelayIoError> {
        let message = match frame {
            RelayFrame::Text(text) => tungstenite::Message::Text(text),
            RelayFrame::Binary(bytes) => tungstenite::Message::Binary(bytes),
        };
        self.0.send(message).await.map_err(transport)
    }

    async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), RelayIoError> {
        let frame = tungstenite::protocol::CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(truncate_reason(reason)),
        };
        self.0
            .send(tungstenite::Message::Close(Some(frame)))
            .await
            .map_err(transport)
    }
}

/// Opens one backend WebSocket per relayed client.
pub struct TungsteniteDialer {
    url: Url,
}

impl TungsteniteDialer {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl BackendDialer for TungsteniteDialer {
    type Source = TungsteniteSource;
    type Sink = TungsteniteSink;

    async fn dial(&self) -> Result<(TungsteniteSource, TungsteniteSink), RelayIoError> {
        let (stream, _) = connect_async(self.url.as_str()).await.map_err(transport)?;
        let (tx, rx) = stream.split();
        Ok((TungsteniteSource(rx), TungsteniteSink(tx)))
    }
}

/// Terminal master over a message connection. Messages that are valid UTF-8 go out as
/// text frames, which is what browser clients expect; anything else is sent as binary.
pub struct FramedMaster<S, K> {
    source: Mutex<S>,
    sink: Mutex<K>,
}

impl<S: FrameSource, K: FrameSink> FramedMaster<S, K> {
    pub fn new(source: S, sink: K) -> Self {
        Self {
            source: Mutex::new(source),
            sink: Mutex::new(sink),
        }
    }

    /// Sends a close frame. Errors are ignored; the peer may already be gone.
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self.sink.lock().await.close_with(code, reason).await;
    }
}

fn io_error(err: RelayIoError) -> io::Error {
    let kind = match err {
        RelayIoError::Closed(_) => io::ErrorKind::ConnectionAborted,
        RelayIoError::Transport(_) => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

#[async_trait]
impl<S: FrameSource, K: FrameSink> Master for FramedMaster<S, K> {
    async fn read(&self) -> io::Result<Vec<u8>> {
        let frame = self.source.lock().await.recv().await.map_err(io_error)?;
        Ok(frame.into_bytes())
    }

    async fn write(&self, message: &[u8]) -> io::Result<()> {
        let frame = match std::str::from_utf8(message) {
            Ok(text) => RelayFrame::Text(text.to_owned()),
            Err(_) => RelayFrame::Binary(message.to_vec()),
        };
        self.sink.lock().await.send(frame).await.map_err(io_error)
    }
}
