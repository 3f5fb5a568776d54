use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Smallest buffer size that still leaves room for one base64 quantum after the tag byte.
pub const MIN_BUFFER_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Payload transform applied to terminal I/O message bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// Bytes pass through untouched.
    #[default]
    Null,
    /// Standard padded base64, safe for text frames.
    Base64,
}

impl Codec {
    /// Resolves the name a client sends with `SetEncoding`.
    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"base64" => Some(Codec::Base64),
            b"null" => Some(Codec::Null),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Null => "null",
            Codec::Base64 => "base64",
        }
    }

    pub fn encode(self, data: &[u8]) -> Vec<u8> {
        match self {
            Codec::Null => data.to_vec(),
            Codec::Base64 => STANDARD.encode(data).into_bytes(),
        }
    }

    pub fn decode(self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Null => Ok(data.to_vec()),
            Codec::Base64 => Ok(STANDARD.decode(data)?),
        }
    }
}

/// Largest raw chunk whose tagged base64 form fits in `buffer_size` bytes.
pub fn max_raw_chunk(buffer_size: usize) -> usize {
    (buffer_size.saturating_sub(1) / 4) * 3
}
