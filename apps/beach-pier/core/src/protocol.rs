//! Wire contract shared with the browser client.
//!
//! Every message on the terminal channel is a single ASCII tag byte followed by an
//! opaque payload. The tag values below must match the client bundle exactly; a
//! mismatch is a deployment error and is not negotiated at runtime.

use serde::{Deserialize, Serialize};

/// WebSocket close code sent when the peer breaks protocol or fails authentication.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code sent when a dependency is temporarily unavailable.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Tags of messages sent by the client (master) to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTag {
    Input,
    Ping,
    ResizeTerminal,
    SetEncoding,
    UploadFile,
    UploadCancel,
}

impl ClientTag {
    pub const fn byte(self) -> u8 {
        match self {
            ClientTag::Input => b'1',
            ClientTag::Ping => b'2',
            ClientTag::ResizeTerminal => b'3',
            ClientTag::SetEncoding => b'4',
            ClientTag::UploadFile => b'7',
            ClientTag::UploadCancel => b'8',
        }
    }
}

impl TryFrom<u8> for ClientTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'1' => Ok(ClientTag::Input),
            b'2' => Ok(ClientTag::Ping),
            b'3' => Ok(ClientTag::ResizeTerminal),
            b'4' => Ok(ClientTag::SetEncoding),
            b'7' => Ok(ClientTag::UploadFile),
            b'8' => Ok(ClientTag::UploadCancel),
            other => Err(other),
        }
    }
}

/// Tags of messages sent by the server to the client (master).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTag {
    Output,
    Pong,
    SetWindowTitle,
    SetPreferences,
    SetReconnect,
    SetBufferSize,
}

impl ServerTag {
    pub const fn byte(self) -> u8 {
        match self {
            ServerTag::Output => b'1',
            ServerTag::Pong => b'2',
            ServerTag::SetWindowTitle => b'3',
            ServerTag::SetPreferences => b'4',
            ServerTag::SetReconnect => b'5',
            ServerTag::SetBufferSize => b'6',
        }
    }
}

impl TryFrom<u8> for ServerTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'1' => Ok(ServerTag::Output),
            b'2' => Ok(ServerTag::Pong),
            b'3' => Ok(ServerTag::SetWindowTitle),
            b'4' => Ok(ServerTag::SetPreferences),
            b'5' => Ok(ServerTag::SetReconnect),
            b'6' => Ok(ServerTag::SetBufferSize),
            other => Err(other),
        }
    }
}

/// Prepends `tag` to `payload`, producing one complete wire message.
pub fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload.len() + 1);
    message.push(tag);
    message.extend_from_slice(payload);
    message
}

/// Splits a wire message into its tag byte and payload. Returns `None` for an empty message.
pub fn split(message: &[u8]) -> Option<(u8, &[u8])> {
    message.split_first().map(|(tag, payload)| (*tag, payload))
}

/// Payload of `ResizeTerminal`. The client sends JavaScript numbers; a missing axis is 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResizeTerminal {
    #[serde(rename = "Columns", default)]
    pub columns: f64,
    #[serde(rename = "Rows", default)]
    pub rows: f64,
}

/// Payload of `UploadFile`: one chunk of a sequential file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileMessage {
    pub name: String,
    pub size: i64,
    pub chunk: i64,
    #[serde(rename = "totalChunks")]
    pub total_chunks: i64,
    /// Base64 encoded chunk bytes.
    pub data: String,
}

/// First message a client sends on a freshly opened socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(rename = "AuthToken", default)]
    pub auth_token: String,
    #[serde(rename = "Arguments", default)]
    pub arguments: String,
}
