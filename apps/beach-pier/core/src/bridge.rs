//! Bridges a PTY slave to its remote master over the tagged terminal protocol.
//!
//! Two loops run for the life of a session: slave output is base64 encoded and sent to
//! the master as `Output`, and master messages are dispatched by tag into slave input,
//! resizes, codec switches, pings and file uploads. Every write to the master goes
//! through one lock so whole messages never interleave.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::{max_raw_chunk, Codec, CodecError, MIN_BUFFER_SIZE};
use crate::peer::{Master, Slave};
use crate::protocol::{self, ClientTag, ResizeTerminal, ServerTag};
use crate::upload::{UploadError, UploadProgress, UploadState};

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// How a session ended when nothing went wrong on the protocol level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Reading from the slave failed or hit end of file.
    SlaveClosed,
    /// Reading from the master failed.
    MasterClosed,
    /// The governing cancellation token fired.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to send {message}: {source}")]
    Initialize {
        message: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("unexpected zero length read from master")]
    EmptyMessage,
    #[error("unknown message type `{0}`")]
    UnknownMessageType(char),
    #[error("received malformed remote command for terminal resize: {0}")]
    MalformedResize(String),
    #[error("failed to decode received data: {0}")]
    Decode(#[from] CodecError),
    #[error("failed to write received data to slave: {0}")]
    SlaveWrite(#[source] io::Error),
    #[error("failed to write to master: {0}")]
    MasterWrite(#[source] io::Error),
    #[error("failed to handle file upload: {0}")]
    Upload(#[from] UploadError),
}

impl BridgeError {
    /// IO failed on one side of the session; the peer did nothing wrong.
    pub fn is_io(&self) -> bool {
        match self {
            BridgeError::Initialize { .. }
            | BridgeError::SlaveWrite(_)
            | BridgeError::MasterWrite(_) => true,
            BridgeError::Upload(err) => err.is_io(),
            _ => false,
        }
    }
}

/// Per-session settings negotiated before the bridge starts.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    permit_write: bool,
    columns: u16,
    rows: u16,
    reconnect: u64,
    master_preferences: Option<Vec<u8>>,
    window_title: Vec<u8>,
    buffer_size: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            permit_write: false,
            columns: 0,
            rows: 0,
            reconnect: 0,
            master_preferences: None,
            window_title: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl BridgeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets the master write input and upload files to the slave.
    pub fn with_permit_write(mut self, permit: bool) -> Self {
        self.permit_write = permit;
        self
    }

    /// Pins the terminal size. Zero leaves that axis under client control.
    pub fn with_fixed_size(mut self, columns: u16, rows: u16) -> Self {
        self.columns = columns;
        self.rows = rows;
        self
    }

    /// Advertises automatic reconnection to the client. Zero disables it.
    pub fn with_reconnect(mut self, seconds: u64) -> Self {
        self.reconnect = seconds;
        self
    }

    /// Opaque JSON preferences forwarded to the client terminal.
    pub fn with_master_preferences(mut self, preferences: impl Into<Vec<u8>>) -> Self {
        self.master_preferences = Some(preferences.into());
        self
    }

    pub fn with_window_title(mut self, title: impl Into<Vec<u8>>) -> Self {
        self.window_title = title.into();
        self
    }

    /// Maximum size of one message sent to the master. Clamped to [`MIN_BUFFER_SIZE`].
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(MIN_BUFFER_SIZE);
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn fixed_size(&self) -> bool {
        self.columns != 0 && self.rows != 0
    }
}

/// One terminal session between a master and a slave.
///
/// The bridge never closes either peer; their lifetime belongs to the caller.
pub struct Bridge<M, S> {
    master: Arc<M>,
    slave: Arc<S>,
    options: BridgeOptions,
    write_lock: Mutex<()>,
    inbound: Inbound,
}

#[derive(Default)]
struct Inbound {
    codec: Codec,
    upload: UploadState,
}

struct MasterWriter<'a, M> {
    master: &'a M,
    lock: &'a Mutex<()>,
}

impl<M: Master> MasterWriter<'_, M> {
    async fn send(&self, tag: ServerTag, payload: &[u8]) -> io::Result<()> {
        let message = protocol::frame(tag.byte(), payload);
        let _guard = self.lock.lock().await;
        self.master.write(&message).await
    }
}

impl<M: Master, S: Slave> Bridge<M, S> {
    pub fn new(master: Arc<M>, slave: Arc<S>, options: BridgeOptions) -> Self {
        Self {
            master,
            slave,
            options,
            write_lock: Mutex::new(()),
            inbound: Inbound::default(),
        }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Codec currently applied to `Input` payloads.
    pub fn codec(&self) -> Codec {
        self.inbound.codec
    }

    pub fn upload_in_progress(&self) -> bool {
        !self.inbound.upload.is_idle()
    }

    /// Sends the initialization sequence, then relays until one side closes, a protocol
    /// violation occurs, or `cancel` fires. Call once per session.
    ///
    /// Cancellation returns promptly: pending reads are dropped rather than awaited.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SessionEnd, BridgeError> {
        let Self {
            master,
            slave,
            options,
            write_lock,
            inbound,
        } = self;
        let writer = MasterWriter {
            master: master.as_ref(),
            lock: write_lock,
        };

        send_initialize_message(&writer, options).await?;

        let outbound = forward_slave_output(slave.as_ref(), &writer, options.buffer_size);
        let inbound = inbound.process(master.as_ref(), slave.as_ref(), &writer, options);

        tokio::select! {
            _ = cancel.cancelled() => Ok(SessionEnd::Cancelled),
            end = outbound => end,
            end = inbound => end,
        }
    }

    /// Releases the upload file handle, if any. Idempotent; leaves both peers open.
    pub fn close(&mut self) {
        self.inbound.upload.close();
    }
}

async fn send_initialize_message<M: Master>(
    writer: &MasterWriter<'_, M>,
    options: &BridgeOptions,
) -> Result<(), BridgeError> {
    let initialize =
        |message: &'static str| move |source: io::Error| BridgeError::Initialize { message, source };

    writer
        .send(ServerTag::SetWindowTitle, &options.window_title)
        .await
        .map_err(initialize("window title"))?;

    let buffer_size = options.buffer_size.to_string();
    writer
        .send(ServerTag::SetBufferSize, buffer_size.as_bytes())
        .await
        .map_err(initialize("buffer size"))?;

    if options.reconnect > 0 {
        let reconnect = options.reconnect.to_string();
        writer
            .send(ServerTag::SetReconnect, reconnect.as_bytes())
            .await
            .map_err(initialize("reconnect"))?;
    }

    if let Some(preferences) = &options.master_preferences {
        writer
            .send(ServerTag::SetPreferences, preferences)
            .await
            .map_err(initialize("preferences"))?;
    }

    Ok(())
}

async fn forward_slave_output<M: Master, S: Slave>(
    slave: &S,
    writer: &MasterWriter<'_, M>,
    buffer_size: usize,
) -> Result<SessionEnd, BridgeError> {
    let mut buffer = vec![0u8; max_raw_chunk(buffer_size)];
    loop {
        let read = match slave.read(&mut buffer).await {
            Ok(0) | Err(_) => return Ok(SessionEnd::SlaveClosed),
            Ok(read) => read,
        };
        let encoded = Codec::Base64.encode(&buffer[..read]);
        writer
            .send(ServerTag::Output, &encoded)
            .await
            .map_err(BridgeError::MasterWrite)?;
    }
}

impl Inbound {
    async fn process<M: Master, S: Slave>(
        &mut self,
        master: &M,
        slave: &S,
        writer: &MasterWriter<'_, M>,
        options: &BridgeOptions,
    ) -> Result<SessionEnd, BridgeError> {
        loop {
            let message = match master.read().await {
                Ok(message) => message,
                Err(_) => return Ok(SessionEnd::MasterClosed),
            };
            self.dispatch(&message, slave, writer, options).await?;
        }
    }

    async fn dispatch<M: Master, S: Slave>(
        &mut self,
        message: &[u8],
        slave: &S,
        writer: &MasterWriter<'_, M>,
        options: &BridgeOptions,
    ) -> Result<(), BridgeError> {
        let (tag, payload) = protocol::split(message).ok_or(BridgeError::EmptyMessage)?;
        let tag = ClientTag::try_from(tag)
            .map_err(|unknown| BridgeError::UnknownMessageType(char::from(unknown)))?;

        match tag {
            ClientTag::Input => {
                if !options.permit_write || payload.is_empty() {
                    return Ok(());
                }
                let decoded = self.codec.decode(payload)?;
                slave
                    .write(&decoded)
                    .await
                    .map_err(BridgeError::SlaveWrite)?;
            }

            ClientTag::Ping => {
                writer
                    .send(ServerTag::Pong, &[])
                    .await
                    .map_err(BridgeError::MasterWrite)?;
            }

            ClientTag::SetEncoding => {
                if let Some(codec) = Codec::from_name(payload) {
                    debug!(codec = codec.name(), "input encoding changed");
                    self.codec = codec;
                }
            }

            ClientTag::ResizeTerminal => {
                if options.fixed_size() {
                    return Ok(());
                }
                if payload.is_empty() {
                    return Err(BridgeError::MalformedResize("empty payload".into()));
                }
                let args = serde_json::from_slice::<Option<ResizeTerminal>>(payload)
                    .map_err(|err| BridgeError::MalformedResize(err.to_string()))?
                    .unwrap_or_default();

                let columns = match options.columns {
                    0 => dimension(args.columns),
                    fixed => fixed,
                };
                let rows = match options.rows {
                    0 => dimension(args.rows),
                    fixed => fixed,
                };
                if let Err(err) = slave.resize_terminal(columns, rows) {
                    debug!(columns, rows, error = %err, "slave rejected resize");
                }
            }

            ClientTag::UploadFile => {
                if !options.permit_write || payload.is_empty() {
                    return Ok(());
                }
                let progress = self
                    .upload
                    .handle_payload(payload, || slave.working_dir())
                    .await?;
                match progress {
                    UploadProgress::Received { chunk, total } => {
                        trace!(chunk, total, "upload chunk written");
                    }
                    UploadProgress::Completed { path } => {
                        debug!(path = %path.display(), "upload written");
                    }
                }
            }

            ClientTag::UploadCancel => self.upload.cancel().await,
        }

        Ok(())
    }
}

/// Client dimensions arrive as JavaScript numbers; out-of-range values saturate.
fn dimension(value: f64) -> u16 {
    value as u16
}
