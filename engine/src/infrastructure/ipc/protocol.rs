//! Handshake protocol spoken over the IPC channels
//!
//! Three optional channels per application:
//! - init: the child sends `[INITIALIZE_DONE]` once it finished starting up
//! - health: the child sends `[HEALTH_OK]` periodically
//! - exit: the agent sends `[EXIT]` to ask for a graceful shutdown
//!
//! Unrecognized lines are logged and skipped; the channel stays open.

use super::connection::{IpcConnection, IpcError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const INITIALIZE_DONE: &str = "[INITIALIZE_DONE]";
pub const HEALTH_OK: &str = "[HEALTH_OK]";
pub const EXIT: &str = "[EXIT]";

/// Environment variables carrying the socket paths to the child
pub const INIT_PIPE_ENV: &str = "DEPLOYER_INIT_PIPE";
pub const HEALTH_PIPE_ENV: &str = "DEPLOYER_HEALTH_PIPE";
pub const EXIT_PIPE_ENV: &str = "DEPLOYER_EXIT_PIPE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    InitializeDone,
    HealthOk,
    Exit,
    Unknown(String),
}

impl ProtocolMessage {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            INITIALIZE_DONE => ProtocolMessage::InitializeDone,
            HEALTH_OK => ProtocolMessage::HealthOk,
            EXIT => ProtocolMessage::Exit,
            other => ProtocolMessage::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProtocolMessage::InitializeDone => INITIALIZE_DONE,
            ProtocolMessage::HealthOk => HEALTH_OK,
            ProtocolMessage::Exit => EXIT,
            ProtocolMessage::Unknown(line) => line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Init,
    Health,
    Exit,
}

impl ChannelKind {
    pub fn suffix(self) -> &'static str {
        match self {
            ChannelKind::Init => "init",
            ChannelKind::Health => "health",
            ChannelKind::Exit => "exit",
        }
    }

    pub fn env_var(self) -> &'static str {
        match self {
            ChannelKind::Init => INIT_PIPE_ENV,
            ChannelKind::Health => HEALTH_PIPE_ENV,
            ChannelKind::Exit => EXIT_PIPE_ENV,
        }
    }
}

/// Socket path of one channel of an application, e.g. `{ipc_dir}/web-1.2.0.init.sock`
pub fn channel_path(ipc_dir: &Path, channel_prefix: &str, kind: ChannelKind) -> PathBuf {
    let safe: String = channel_prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    ipc_dir.join(format!("{}.{}.sock", safe, kind.suffix()))
}

/// Read until `expected` arrives, skipping anything else
async fn wait_for(
    connection: &IpcConnection,
    expected: ProtocolMessage,
    timeout: Duration,
) -> Result<(), IpcError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let line = connection.read_message_within(remaining).await?;
        match ProtocolMessage::parse(&line) {
            message if message == expected => return Ok(()),
            message => warn!(
                connection = %connection.name(),
                expected = %expected.as_str(),
                received = %message.as_str(),
                "Unrecognized protocol message"
            ),
        }
    }
}

// Agent side

pub async fn wait_for_initialization(
    connection: &IpcConnection,
    timeout: Duration,
) -> Result<(), IpcError> {
    wait_for(connection, ProtocolMessage::InitializeDone, timeout).await
}

pub async fn wait_for_heartbeat(connection: &IpcConnection, timeout: Duration) -> Result<(), IpcError> {
    wait_for(connection, ProtocolMessage::HealthOk, timeout).await
}

pub async fn request_exit(connection: &IpcConnection) -> Result<(), IpcError> {
    connection.send_message(EXIT).await
}

// Child side

pub async fn signal_initialization_done(connection: &IpcConnection) -> Result<(), IpcError> {
    connection.send_message(INITIALIZE_DONE).await
}

pub async fn send_heartbeat(connection: &IpcConnection) -> Result<(), IpcError> {
    connection.send_message(HEALTH_OK).await
}

/// Block until the agent asks for shutdown
pub async fn wait_for_exit_request(connection: &IpcConnection) -> Result<(), IpcError> {
    loop {
        let line = match connection.read_message().await {
            Ok(line) => line,
            Err(IpcError::Timeout { .. }) => continue,
            Err(e) => return Err(e),
        };
        match ProtocolMessage::parse(&line) {
            ProtocolMessage::Exit => return Ok(()),
            message => warn!(
                connection = %connection.name(),
                received = %message.as_str(),
                "Unrecognized protocol message, still waiting for exit request"
            ),
        }
    }
}

/// Channels handed to a child process through its environment
pub struct ChildChannels {
    pub init: Option<IpcConnection>,
    pub health: Option<IpcConnection>,
    pub exit: Option<IpcConnection>,
}

impl ChildChannels {
    /// Connect to every channel the agent advertised in the environment
    pub async fn connect_from_env(timeout: Duration) -> Result<Self, IpcError> {
        Ok(Self {
            init: Self::connect_one(ChannelKind::Init, timeout).await?,
            health: Self::connect_one(ChannelKind::Health, timeout).await?,
            exit: Self::connect_one(ChannelKind::Exit, timeout).await?,
        })
    }

    async fn connect_one(kind: ChannelKind, timeout: Duration) -> Result<Option<IpcConnection>, IpcError> {
        let Ok(path) = std::env::var(kind.env_var()) else {
            return Ok(None);
        };
        let connection = IpcConnection::client(kind.suffix(), path, timeout);
        connection.connect().await?;
        Ok(Some(connection))
    }
}
