use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use beach_pier_core::protocol::split;
use beach_pier_core::ServerTag;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("empty message from server")]
    Empty,
    #[error("unknown server message type `{0}`")]
    UnknownTag(char),
    #[error("output is not valid base64: {0}")]
    Output(#[from] base64::DecodeError),
    #[error("preferences are not valid JSON: {0}")]
    Preferences(#[from] serde_json::Error),
    #[error("expected a number, got {0:?}")]
    Number(String),
}

/// A decoded server→client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Raw terminal output, already base64-decoded.
    Output(Vec<u8>),
    Pong,
    WindowTitle(String),
    Preferences(serde_json::Value),
    /// Seconds to wait before reconnecting after the socket drops.
    Reconnect(u64),
    /// Largest message the server accepts, including the tag byte.
    BufferSize(usize),
}

impl ServerEvent {
    pub fn parse(message: &[u8]) -> Result<Self, EventError> {
        let (tag, payload) = split(message).ok_or(EventError::Empty)?;
        let tag =
            ServerTag::try_from(tag).map_err(|unknown| EventError::UnknownTag(char::from(unknown)))?;

        Ok(match tag {
            ServerTag::Output => ServerEvent::Output(STANDARD.decode(payload)?),
            ServerTag::Pong => ServerEvent::Pong,
            ServerTag::SetWindowTitle => {
                ServerEvent::WindowTitle(String::from_utf8_lossy(payload).into_owned())
            }
            ServerTag::SetPreferences => ServerEvent::Preferences(serde_json::from_slice(payload)?),
            ServerTag::SetReconnect => ServerEvent::Reconnect(number(payload)?),
            ServerTag::SetBufferSize => ServerEvent::BufferSize(number(payload)?),
        })
    }
}

fn number<T: std::str::FromStr>(payload: &[u8]) -> Result<T, EventError> {
    let text = String::from_utf8_lossy(payload);
    text.trim()
        .parse()
        .map_err(|_| EventError::Number(text.into_owned()))
}
