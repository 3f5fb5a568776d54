//! Client-side helpers for the Beach pier terminal protocol. Browser and CLI clients both
//! build their messages through these functions so the tag bytes and payload shapes stay
//! in one place.

pub mod events;
pub mod upload;

use beach_pier_core::protocol::frame;
use beach_pier_core::{ClientTag, Codec, InitMessage};
use serde_json::json;

pub use events::{EventError, ServerEvent};
pub use upload::{PlanError, UploadPlan, PREFERRED_CHUNK_SIZE};

/// Keystrokes or pasted text, encoded with the codec the server currently expects.
pub fn input(data: &[u8], codec: Codec) -> Vec<u8> {
    frame(ClientTag::Input.byte(), &codec.encode(data))
}

pub fn ping() -> Vec<u8> {
    frame(ClientTag::Ping.byte(), &[])
}

/// Switches how the server decodes subsequent `input` payloads.
pub fn set_encoding(codec: Codec) -> Vec<u8> {
    frame(ClientTag::SetEncoding.byte(), codec.name().as_bytes())
}

pub fn resize(columns: u16, rows: u16) -> Vec<u8> {
    let payload = json!({ "Columns": columns, "Rows": rows }).to_string();
    frame(ClientTag::ResizeTerminal.byte(), payload.as_bytes())
}

/// Abandons the upload in flight; the server deletes the partial file.
pub fn upload_cancel() -> Vec<u8> {
    frame(ClientTag::UploadCancel.byte(), &[])
}

/// First text message on a new socket. `arguments` is a URL query string such as
/// `arg=-l&arg=/tmp`, honoured only when the server permits arguments.
pub fn init_message(auth_token: &str, arguments: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&InitMessage {
        auth_token: auth_token.to_string(),
        arguments: arguments.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beach_pier_core::ResizeTerminal;

    #[test]
    fn input_respects_codec() {
        assert_eq!(input(b"ls\r", Codec::Null), b"1ls\r");
        assert_eq!(input(b"hi", Codec::Base64), b"1aGk=");
    }

    #[test]
    fn control_messages_carry_expected_tags() {
        assert_eq!(ping(), b"2");
        assert_eq!(upload_cancel(), b"8");
        assert_eq!(set_encoding(Codec::Base64), b"4base64");
    }

    #[test]
    fn resize_payload_parses_as_server_type() {
        let message = resize(132, 43);
        assert_eq!(message[0], b'3');
        let parsed: ResizeTerminal = serde_json::from_slice(&message[1..]).expect("resize json");
        assert_eq!(parsed.columns, 132.0);
        assert_eq!(parsed.rows, 43.0);
    }

    #[test]
    fn init_message_uses_wire_field_names() {
        let text = init_message("secret", "arg=-l").expect("init");
        assert_eq!(text, r#"{"AuthToken":"secret","Arguments":"arg=-l"}"#);
    }
}
