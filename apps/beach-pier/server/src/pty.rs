use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use beach_pier_core::{Slave, TitleVariables};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;
const OUTPUT_QUEUE: usize = 64;

struct Output {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// A command running under a pseudo terminal. Output is pumped by a dedicated reader
/// thread; writes and resizes go straight to the PTY master.
pub struct PtySlave {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    output: AsyncMutex<Output>,
    command: Vec<String>,
    pid: Option<u32>,
}

impl PtySlave {
    pub fn spawn(command: &[String], columns: u16, rows: u16) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols: columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {program}"))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        spawn_reader(reader, tx);

        let pid = child.process_id();
        debug!(?pid, command = %program, "pty command started");

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            output: AsyncMutex::new(Output {
                rx,
                pending: Vec::new(),
            }),
            command: command.to_vec(),
            pid,
        })
    }

    /// Signals the command if it is still running. Never blocks; returns whether the
    /// command was still alive. Safe to call more than once.
    pub fn kill(&self) -> bool {
        let mut child = self.child.lock();
        if !matches!(child.try_wait(), Ok(None)) {
            return false;
        }
        if let Err(err) = child.kill() {
            debug!(error = %err, "failed to kill pty command");
        }
        true
    }

    /// Kills the command and reaps it on the blocking pool.
    pub async fn terminate(&self) {
        if !self.kill() {
            return;
        }
        let child = self.child.clone();
        let reaped = tokio::task::spawn_blocking(move || child.lock().wait()).await;
        match reaped {
            Ok(Ok(status)) => debug!(?status, "pty command exited"),
            Ok(Err(err)) => debug!(error = %err, "failed to reap pty command"),
            Err(err) => debug!(error = %err, "reaper task failed"),
        }
    }
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    trace!(error = %err, "pty reader stopped");
                    break;
                }
            }
        }
    });
}

impl Drop for PtySlave {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

#[async_trait]
impl Slave for PtySlave {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut output = self.output.lock().await;
        if output.pending.is_empty() {
            match output.rx.recv().await {
                Some(chunk) => output.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = output.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&output.pending[..n]);
        output.pending.drain(..n);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> io::Result<usize> {
            let mut writer = writer.lock();
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(data.len())
        })
        .await
        .map_err(io::Error::other)?
    }

    fn window_title_variables(&self) -> TitleVariables {
        let mut vars = TitleVariables::new();
        vars.insert(
            "command".into(),
            json!(self.command.first().cloned().unwrap_or_default()),
        );
        vars.insert("argv".into(), json!(self.command.get(1..).unwrap_or_default()));
        if let Some(pid) = self.pid {
            vars.insert("pid".into(), json!(pid));
        }
        vars
    }

    fn resize_terminal(&self, columns: u16, rows: u16) -> io::Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols: columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| io::Error::other(err.to_string()))
    }

    fn working_dir(&self) -> io::Result<PathBuf> {
        match self.pid {
            Some(pid) => std::fs::read_link(format!("/proc/{pid}/cwd")),
            None => std::env::current_dir(),
        }
    }
}
