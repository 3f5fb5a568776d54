use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

/// Values available to the window title template.
pub type TitleVariables = HashMap<String, serde_json::Value>;

/// The remote, message-framed side of a terminal session.
///
/// One `read` yields exactly one complete message and one `write` sends exactly one.
/// Implementations must tolerate a `read` and a `write` running concurrently.
#[async_trait]
pub trait Master: Send + Sync {
    async fn read(&self) -> io::Result<Vec<u8>>;

    async fn write(&self, message: &[u8]) -> io::Result<()>;
}

/// The local process side of a terminal session, usually a command under a PTY.
///
/// The bridge reads from one task and writes from another; implementations must allow
/// one concurrent reader and one concurrent writer.
#[async_trait]
pub trait Slave: Send + Sync {
    /// Reads process output. `Ok(0)` means the process side is gone.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, data: &[u8]) -> io::Result<usize>;

    fn window_title_variables(&self) -> TitleVariables;

    fn resize_terminal(&self, columns: u16, rows: u16) -> io::Result<()>;

    /// Current working directory of the process, used as the upload destination.
    fn working_dir(&self) -> io::Result<PathBuf>;
}
