//! Core of the Beach pier service: the tagged terminal protocol bridge and the
//! transcription relay.
//!
//! Nothing in this crate opens sockets or spawns processes. Transports and PTYs plug in
//! through the [`Master`], [`Slave`], [`FrameSource`], [`FrameSink`] and
//! [`BackendDialer`] capabilities, which keeps every state machine testable against
//! in-memory fakes.

pub mod bridge;
pub mod codec;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod title;
pub mod upload;

pub use bridge::{Bridge, BridgeError, BridgeOptions, SessionEnd, DEFAULT_BUFFER_SIZE};
pub use codec::{Codec, CodecError};
pub use peer::{Master, Slave, TitleVariables};
pub use protocol::{
    ClientTag, InitMessage, ResizeTerminal, ServerTag, UploadFileMessage, CLOSE_POLICY_VIOLATION,
    CLOSE_TRY_AGAIN_LATER,
};
pub use relay::{
    authenticate, read_init, BackendDialer, Direction, FrameSink, FrameSource, HandshakeError, PumpStats, PumpStop,
    RelayConfig, RelayError, RelayFrame, RelayIoError, RelayProxy, RelayReport,
};
pub use title::{render_title, TitleError, DEFAULT_TITLE_FORMAT};
pub use upload::{UploadError, UploadProgress, UploadState};
