//! Splits a file into `UploadFile` messages that each fit the server's buffer size.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use beach_pier_core::protocol::frame;
use beach_pier_core::{ClientTag, UploadFileMessage};
use thiserror::Error;

/// Raw bytes per chunk when the buffer size leaves more room than this.
pub const PREFERRED_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{0} is empty")]
    EmptyFile(String),
    #[error("buffer size {buffer_size} leaves no room for file data in {name}")]
    ChunkTooLarge { name: String, buffer_size: usize },
    #[error("expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("failed to encode upload message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    name: String,
    size: usize,
    chunk_size: usize,
    total_chunks: usize,
}

impl UploadPlan {
    /// Plans the transfer of `size` bytes named `name` to a server advertising
    /// `buffer_size` (see `SetBufferSize`).
    ///
    /// The chunk size is chosen against the worst-case JSON envelope, with the largest
    /// chunk index and total the file could need, so every message fits.
    pub fn new(name: &str, size: usize, buffer_size: usize) -> Result<Self, PlanError> {
        if size == 0 {
            return Err(PlanError::EmptyFile(name.to_string()));
        }

        let max_payload = buffer_size.saturating_sub(1);
        let envelope = envelope(name, size, size - 1, size, "")?;
        let available = max_payload.saturating_sub(envelope.len());
        if available < 4 {
            return Err(PlanError::ChunkTooLarge {
                name: name.to_string(),
                buffer_size,
            });
        }

        let chunk_size = PREFERRED_CHUNK_SIZE.min(available / 4 * 3);
        Ok(Self {
            name: name.to_string(),
            size,
            chunk_size,
            total_chunks: size.div_ceil(chunk_size),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Builds the framed `UploadFile` message for chunk `index`.
    pub fn message(&self, index: usize, data: &[u8]) -> Result<Vec<u8>, PlanError> {
        let payload = envelope(
            &self.name,
            self.size,
            index,
            self.total_chunks,
            &STANDARD.encode(data),
        )?;
        Ok(frame(ClientTag::UploadFile.byte(), &payload))
    }

    /// Every message of the transfer, in the order the server requires.
    pub fn messages(&self, contents: &[u8]) -> Result<Vec<Vec<u8>>, PlanError> {
        if contents.len() != self.size {
            return Err(PlanError::SizeMismatch {
                expected: self.size,
                actual: contents.len(),
            });
        }
        contents
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, data)| self.message(index, data))
            .collect()
    }
}

fn envelope(
    name: &str,
    size: usize,
    chunk: usize,
    total_chunks: usize,
    data: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&UploadFileMessage {
        name: name.to_string(),
        size: size as i64,
        chunk: chunk as i64,
        total_chunks: total_chunks as i64,
        data: data.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_buffers_use_the_preferred_chunk() {
        let plan = UploadPlan::new("big.bin", 100_000, 1 << 20).expect("plan");
        assert_eq!(plan.chunk_size(), PREFERRED_CHUNK_SIZE);
        assert_eq!(plan.total_chunks(), 13);
    }

    #[test]
    fn every_message_fits_the_buffer() {
        let contents: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
        let plan = UploadPlan::new("data.bin", contents.len(), 1024).expect("plan");
        assert!(plan.chunk_size() < PREFERRED_CHUNK_SIZE);

        let messages = plan.messages(&contents).expect("messages");
        assert_eq!(messages.len(), plan.total_chunks());
        for message in &messages {
            assert!(message.len() <= 1024, "{} bytes", message.len());
            assert_eq!(message[0], b'7');
        }

        let mut rebuilt = Vec::new();
        for (index, message) in messages.iter().enumerate() {
            let chunk: UploadFileMessage = serde_json::from_slice(&message[1..]).expect("json");
            assert_eq!(chunk.chunk, index as i64);
            assert_eq!(chunk.total_chunks, plan.total_chunks() as i64);
            rebuilt.extend(STANDARD.decode(chunk.data).expect("base64"));
        }
        assert_eq!(rebuilt, contents);
    }

    #[test]
    fn refuses_empty_files_and_tiny_buffers() {
        assert!(matches!(
            UploadPlan::new("empty.txt", 0, 1024),
            Err(PlanError::EmptyFile(_))
        ));
        assert!(matches!(
            UploadPlan::new("a.txt", 10, 32),
            Err(PlanError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn contents_must_match_the_planned_size() {
        let plan = UploadPlan::new("a.txt", 3, 1024).expect("plan");
        assert!(matches!(
            plan.messages(b"ab"),
            Err(PlanError::SizeMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }
}
