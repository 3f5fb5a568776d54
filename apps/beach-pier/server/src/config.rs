use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use beach_pier_core::codec::MIN_BUFFER_SIZE;
use beach_pier_core::{render_title, TitleVariables, DEFAULT_BUFFER_SIZE, DEFAULT_TITLE_FORMAT};
use clap::Parser;
use thiserror::Error;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Share a terminal command over WebSockets, with an optional transcription relay"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Permit clients to write to the terminal (BE CAREFUL).
    #[arg(short = 'w', long, env = "BEACH_PIER_PERMIT_WRITE", default_value_t = false)]
    pub permit_write: bool,

    /// Token clients must present in their init message. Unset disables the check.
    #[arg(short = 'c', long, env = "BEACH_PIER_CREDENTIAL")]
    pub credential: Option<String>,

    /// Let clients append `arg=` query parameters from their init message to the command.
    #[arg(long, env = "BEACH_PIER_PERMIT_ARGUMENTS", default_value_t = false)]
    pub permit_arguments: bool,

    /// Window title template.
    #[arg(long, env = "BEACH_PIER_TITLE_FORMAT", default_value = DEFAULT_TITLE_FORMAT)]
    pub title_format: String,

    /// JSON preferences forwarded to the browser terminal.
    #[arg(long, env = "BEACH_PIER_TERMINAL_PREFERENCES")]
    pub terminal_preferences: Option<String>,

    /// Ask clients to reconnect automatically.
    #[arg(long, env = "BEACH_PIER_RECONNECT", default_value_t = false)]
    pub reconnect: bool,

    /// Seconds clients wait before reconnecting.
    #[arg(long, env = "BEACH_PIER_RECONNECT_TIME", default_value_t = 10)]
    pub reconnect_time: u64,

    /// Static terminal width; 0 lets clients resize.
    #[arg(long, env = "BEACH_PIER_WIDTH", default_value_t = 0)]
    pub width: u16,

    /// Static terminal height; 0 lets clients resize.
    #[arg(long, env = "BEACH_PIER_HEIGHT", default_value_t = 0)]
    pub height: u16,

    /// Largest message sent to a client, tag byte included.
    #[arg(long, env = "BEACH_PIER_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Maximum concurrent terminal clients; 0 means unlimited.
    #[arg(long, env = "BEACH_PIER_MAX_CONNECTION", default_value_t = 0)]
    pub max_connection: usize,

    /// Accept a single terminal client and exit once it disconnects.
    #[arg(long, env = "BEACH_PIER_ONCE", default_value_t = false)]
    pub once: bool,

    /// Serve the transcription relay at /asr/ws.
    #[arg(long, env = "BEACH_PIER_ENABLE_ASR", default_value_t = false)]
    pub enable_asr: bool,

    /// WebSocket address of the streaming transcription backend.
    #[arg(long, env = "BEACH_PIER_ASR_BACKEND", default_value = "ws://127.0.0.1:6006")]
    pub asr_backend: String,

    /// Token for relay clients; defaults to --credential.
    #[arg(long, env = "BEACH_PIER_ASR_CREDENTIAL")]
    pub asr_credential: Option<String>,

    /// Time clients have to send their init message.
    #[arg(long, env = "BEACH_PIER_HANDSHAKE_TIMEOUT_SECS", default_value_t = 5)]
    pub handshake_timeout_secs: u64,

    /// How long a stopping relay waits for its second direction.
    #[arg(long, env = "BEACH_PIER_RELAY_GRACE_MS", default_value_t = 50)]
    pub relay_grace_ms: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Command to run for each terminal client, followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no command given")]
    MissingCommand,
    #[error("buffer size must be at least {MIN_BUFFER_SIZE}, got {0}")]
    BufferTooSmall(usize),
    #[error("reconnect is enabled, but reconnect-time must be > 0")]
    ReconnectTime,
    #[error("invalid title format: {0}")]
    TitleFormat(String),
    #[error("terminal preferences must be a JSON object: {0}")]
    Preferences(String),
    #[error("ASR backend must be a ws:// or wss:// URL, got {0}")]
    AsrBackend(String),
}

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub command: Vec<String>,
    pub permit_write: bool,
    pub credential: Option<String>,
    pub permit_arguments: bool,
    pub title_format: String,
    pub preferences: Option<String>,
    /// Seconds advertised to clients, `None` when reconnect is off.
    pub reconnect: Option<u64>,
    pub width: u16,
    pub height: u16,
    pub buffer_size: usize,
    pub max_connection: usize,
    pub once: bool,
}

#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub backend: Url,
    pub credential: String,
    pub grace: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub terminal: TerminalConfig,
    pub asr: Option<AsrConfig>,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let asr = if cli.enable_asr {
            let backend = Url::parse(&cli.asr_backend)
                .map_err(|_| ConfigError::AsrBackend(cli.asr_backend.clone()))?;
            Some(AsrConfig {
                backend,
                credential: cli
                    .asr_credential
                    .or_else(|| cli.credential.clone())
                    .unwrap_or_default(),
                grace: Duration::from_millis(cli.relay_grace_ms),
            })
        } else {
            None
        };

        let config = ServerConfig {
            listen_addr,
            terminal: TerminalConfig {
                command: cli.command,
                permit_write: cli.permit_write,
                credential: cli.credential,
                permit_arguments: cli.permit_arguments,
                title_format: cli.title_format,
                preferences: cli.terminal_preferences,
                reconnect: cli.reconnect.then_some(cli.reconnect_time),
                width: cli.width,
                height: cli.height,
                buffer_size: cli.buffer_size,
                max_connection: cli.max_connection,
                once: cli.once,
            },
            asr,
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let terminal = &self.terminal;
        if terminal.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        if terminal.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall(terminal.buffer_size));
        }
        if terminal.reconnect == Some(0) {
            return Err(ConfigError::ReconnectTime);
        }
        render_title(&terminal.title_format, &TitleVariables::new())
            .map_err(|err| ConfigError::TitleFormat(err.to_string()))?;
        if let Some(preferences) = &terminal.preferences {
            match serde_json::from_str::<serde_json::Value>(preferences) {
                Ok(value) if value.is_object() => {}
                Ok(other) => return Err(ConfigError::Preferences(format!("got {other}"))),
                Err(err) => return Err(ConfigError::Preferences(err.to_string())),
            }
        }
        if let Some(asr) = &self.asr {
            if !matches!(asr.backend.scheme(), "ws" | "wss") {
                return Err(ConfigError::AsrBackend(asr.backend.to_string()));
            }
        }
        Ok(())
    }
}
