use std::io;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::protocol::UploadFileMessage;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to parse upload file message: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid filename: {0}")]
    InvalidFileName(&'static str),
    #[error("invalid total chunks {0}")]
    InvalidTotalChunks(i64),
    #[error("invalid chunk index {chunk} of {total}")]
    InvalidChunkIndex { chunk: i64, total: i64 },
    #[error("out-of-order chunk: expected {expected}, got {got}")]
    OutOfOrder { expected: i64, got: i64 },
    #[error("failed to get working directory: {0}")]
    WorkingDirectory(#[source] io::Error),
    #[error("failed to create file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode file data: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("failed to write to file: {0}")]
    Write(#[source] io::Error),
}

impl UploadError {
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            UploadError::WorkingDirectory(_) | UploadError::Create { .. } | UploadError::Write(_)
        )
    }
}

/// Result of an accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadProgress {
    Received { chunk: i64, total: i64 },
    Completed { path: PathBuf },
}

/// Sequential chunked file transfer. At most one transfer is in flight; its file handle
/// lives exactly as long as the transfer.
#[derive(Debug, Default)]
pub struct UploadState {
    active: Option<ActiveUpload>,
}

#[derive(Debug)]
struct ActiveUpload {
    name: String,
    dir: PathBuf,
    received: i64,
    file: File,
}

impl ActiveUpload {
    fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    async fn finish(mut self) -> Result<PathBuf, UploadError> {
        self.file.flush().await.map_err(UploadError::Write)?;
        Ok(self.path())
    }

    /// Closes the handle for a transfer that will not complete; flush errors are dropped.
    async fn abandon(mut self) -> PathBuf {
        let _ = self.file.flush().await;
        self.path()
    }
}

impl UploadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Name of the transfer in progress, if any.
    pub fn current_file(&self) -> Option<&str> {
        self.active.as_ref().map(|upload| upload.name.as_str())
    }

    /// Parses `payload` as an `UploadFileMessage` and applies it.
    pub async fn handle_payload<F>(
        &mut self,
        payload: &[u8],
        working_dir: F,
    ) -> Result<UploadProgress, UploadError>
    where
        F: FnOnce() -> io::Result<PathBuf>,
    {
        let message: UploadFileMessage = serde_json::from_slice(payload)?;
        self.accept(message, working_dir).await
    }

    /// Applies one chunk. `working_dir` is only consulted when a new transfer starts.
    ///
    /// Chunk zero always starts over: an unfinished transfer is closed and its partial
    /// file is kept on disk.
    pub async fn accept<F>(
        &mut self,
        message: UploadFileMessage,
        working_dir: F,
    ) -> Result<UploadProgress, UploadError>
    where
        F: FnOnce() -> io::Result<PathBuf>,
    {
        validate_file_name(&message.name)?;
        if message.total_chunks <= 0 {
            return Err(UploadError::InvalidTotalChunks(message.total_chunks));
        }
        if message.chunk < 0 || message.chunk >= message.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                chunk: message.chunk,
                total: message.total_chunks,
            });
        }

        if message.chunk == 0 {
            if let Some(previous) = self.active.take() {
                let path = previous.abandon().await;
                debug!(path = %path.display(), "abandoning unfinished upload");
            }

            let dir = working_dir().map_err(UploadError::WorkingDirectory)?;
            let path = dir.join(&message.name);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await
                .map_err(|source| UploadError::Create {
                    path: path.clone(),
                    source,
                })?;
            debug!(path = %path.display(), total = message.total_chunks, "upload started");
            self.active = Some(ActiveUpload {
                name: message.name.clone(),
                dir,
                received: 0,
                file,
            });
        }

        let expected = self.active.as_ref().map_or(0, |upload| upload.received);
        let Some(upload) = self.active.as_mut().filter(|_| message.chunk == expected) else {
            return Err(UploadError::OutOfOrder {
                expected,
                got: message.chunk,
            });
        };

        let data = STANDARD.decode(message.data.as_bytes())?;
        upload
            .file
            .write_all(&data)
            .await
            .map_err(UploadError::Write)?;
        upload.file.flush().await.map_err(UploadError::Write)?;
        upload.received += 1;

        if message.chunk == message.total_chunks - 1 {
            if let Some(done) = self.active.take() {
                let path = done.finish().await?;
                debug!(path = %path.display(), "upload completed");
                return Ok(UploadProgress::Completed { path });
            }
        }

        Ok(UploadProgress::Received {
            chunk: message.chunk,
            total: message.total_chunks,
        })
    }

    /// Aborts the transfer in progress and removes its partial file. Removal is best-effort.
    pub async fn cancel(&mut self) {
        if let Some(upload) = self.active.take() {
            let path = upload.abandon().await;
            let _ = tokio::fs::remove_file(&path).await;
            debug!(path = %path.display(), "upload cancelled");
        }
    }

    /// Drops the file handle without touching the file. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.active = None;
    }
}

/// Accepts relative names only: no absolute paths, no `..` anywhere, and the final
/// component may not be `.` or `..`.
pub fn validate_file_name(name: &str) -> Result<(), UploadError> {
    if name.is_empty() {
        return Err(UploadError::InvalidFileName("empty filename"));
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(UploadError::InvalidFileName("absolute paths are not allowed"));
    }
    if name.contains("..") {
        return Err(UploadError::InvalidFileName("path traversal is not allowed"));
    }
    match base_name(name) {
        "." | ".." => Err(UploadError::InvalidFileName("reserved filename")),
        _ => Ok(()),
    }
}

fn base_name(name: &str) -> &str {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(index) => &trimmed[index + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(name: &str, index: i64, total: i64, data: &[u8]) -> UploadFileMessage {
        UploadFileMessage {
            name: name.to_string(),
            size: 0,
            chunk: index,
            total_chunks: total,
            data: STANDARD.encode(data),
        }
    }

    fn dir_of(tmp: &TempDir) -> impl FnOnce() -> io::Result<PathBuf> {
        let path = tmp.path().to_path_buf();
        move || Ok(path)
    }

    #[test]
    fn rejects_unsafe_names() {
        for name in ["", "/etc/passwd", "\\share", "../x", "a/../b", "a..b", ".", "a/.", "./", "a/./"] {
            assert!(validate_file_name(name).is_err(), "{name:?} should be rejected");
        }
        for name in ["a.txt", "./a.txt", "dir/a.txt", ".hidden"] {
            assert!(validate_file_name(name).is_ok(), "{name:?} should be accepted");
        }
    }

    #[tokio::test]
    async fn sequential_chunks_reassemble_file() {
        let tmp = TempDir::new().expect("tempdir");
        let mut state = UploadState::new();

        let first = state
            .accept(chunk("a.txt", 0, 3, b"A"), dir_of(&tmp))
            .await
            .expect("chunk 0");
        assert_eq!(first, UploadProgress::Received { chunk: 0, total: 3 });
        assert_eq!(state.current_file(), Some("a.txt"));
        state
            .accept(chunk("a.txt", 1, 3, b"B"), || panic!("dir only resolved on chunk 0"))
            .await
            .expect("chunk 1");
        let last = state
            .accept(chunk("a.txt", 2, 3, b"C"), || panic!("dir only resolved on chunk 0"))
            .await
            .expect("chunk 2");

        assert_eq!(
            last,
            UploadProgress::Completed {
                path: tmp.path().join("a.txt")
            }
        );
        assert!(state.is_idle());
        let contents = std::fs::read(tmp.path().join("a.txt")).expect("read upload");
        assert_eq!(contents, b"ABC");
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected_without_writing() {
        let tmp = TempDir::new().expect("tempdir");
        let mut state = UploadState::new();
        state
            .accept(chunk("b.bin", 0, 4, b"one"), dir_of(&tmp))
            .await
            .expect("chunk 0");

        let err = state
            .accept(chunk("b.bin", 2, 4, b"three"), || unreachable!())
            .await
            .expect_err("chunk 2 before 1");
        assert!(matches!(err, UploadError::OutOfOrder { expected: 1, got: 2 }));

        let err = state
            .accept(chunk("b.bin", 0, 4, b"zero"), || Err(io::Error::other("gone")))
            .await
            .expect_err("working dir failure");
        assert!(matches!(err, UploadError::WorkingDirectory(_)));
        assert!(state.is_idle());
        assert_eq!(std::fs::read(tmp.path().join("b.bin")).expect("read"), b"one");
    }

    #[tokio::test]
    async fn non_zero_chunk_while_idle_is_out_of_order() {
        let mut state = UploadState::new();
        let err = state
            .accept(chunk("c.txt", 1, 2, b"x"), || unreachable!())
            .await
            .expect_err("no transfer in progress");
        assert!(matches!(err, UploadError::OutOfOrder { expected: 0, got: 1 }));
    }

    #[tokio::test]
    async fn invalid_bounds_are_rejected_before_state_changes() {
        let mut state = UploadState::new();
        let err = state
            .accept(chunk("d.txt", 0, 0, b""), || unreachable!())
            .await
            .expect_err("zero total");
        assert!(matches!(err, UploadError::InvalidTotalChunks(0)));

        let err = state
            .accept(chunk("d.txt", 3, 3, b""), || unreachable!())
            .await
            .expect_err("index past end");
        assert!(matches!(err, UploadError::InvalidChunkIndex { chunk: 3, total: 3 }));

        let err = state
            .accept(chunk("d.txt", -1, 3, b""), || unreachable!())
            .await
            .expect_err("negative index");
        assert!(matches!(err, UploadError::InvalidChunkIndex { chunk: -1, .. }));
        assert!(state.is_idle());
    }

    #[tokio::test]
    async fn restart_keeps_abandoned_partial_file() {
        let tmp = TempDir::new().expect("tempdir");
        let mut state = UploadState::new();
        state
            .accept(chunk("first.txt", 0, 2, b"partial"), dir_of(&tmp))
            .await
            .expect("first transfer");
        state
            .accept(chunk("second.txt", 0, 1, b"whole"), dir_of(&tmp))
            .await
            .expect("second transfer");

        assert!(state.is_idle());
        assert_eq!(std::fs::read(tmp.path().join("first.txt")).expect("read"), b"partial");
        assert_eq!(std::fs::read(tmp.path().join("second.txt")).expect("read"), b"whole");
    }

    #[tokio::test]
    async fn cancel_removes_partial_file_and_allows_fresh_start() {
        let tmp = TempDir::new().expect("tempdir");
        let mut state = UploadState::new();
        state
            .accept(chunk("big.iso", 0, 5, b"xx"), dir_of(&tmp))
            .await
            .expect("chunk 0");
        state.cancel().await;

        assert!(state.is_idle());
        assert!(!tmp.path().join("big.iso").exists());

        state
            .accept(chunk("small.txt", 0, 1, b"ok"), dir_of(&tmp))
            .await
            .expect("fresh transfer");
        assert_eq!(std::fs::read(tmp.path().join("small.txt")).expect("read"), b"ok");

        state.cancel().await;
        state.close();
        state.close();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn write_failure_is_reported_for_the_failing_chunk() {
        let tmp = TempDir::new().expect("tempdir");
        std::os::unix::fs::symlink("/dev/full", tmp.path().join("full.bin")).expect("symlink");
        let mut state = UploadState::new();

        let err = state
            .accept(chunk("full.bin", 0, 1, b"ABC"), dir_of(&tmp))
            .await
            .expect_err("device is full");
        assert!(matches!(err, UploadError::Write(_)), "got {err:?}");
        assert!(err.is_io());

        let err = state
            .accept(chunk("full.bin", 0, 3, b"ABC"), dir_of(&tmp))
            .await
            .expect_err("first of several chunks");
        assert!(matches!(err, UploadError::Write(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn bad_data_surfaces_decode_error() {
        let tmp = TempDir::new().expect("tempdir");
        let mut state = UploadState::new();
        let mut message = chunk("e.txt", 0, 2, b"");
        message.data = "not base64!".to_string();
        let err = state
            .accept(message, dir_of(&tmp))
            .await
            .expect_err("decode failure");
        assert!(matches!(err, UploadError::Decode(_)));
        assert!(!err.is_io());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_parse_error() {
        let mut state = UploadState::new();
        let err = state
            .handle_payload(b"{not json", || unreachable!())
            .await
            .expect_err("parse failure");
        assert!(matches!(err, UploadError::Parse(_)));
    }
}
