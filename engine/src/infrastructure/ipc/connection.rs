//! Named duplex channel between the agent and a child process
//!
//! Backed by a unix domain socket. The agent side listens on the socket path,
//! the child side connects to it. Messages are UTF-8 lines; the partial line
//! of a read that times out stays buffered for the next read.

use crate::domain::DomainError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

const CLIENT_CONNECT_RETRY: Duration = Duration::from_millis(50);
const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("Connection '{0}' is not connected")]
    NotConnected(String),

    #[error("Connection '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("{operation} on '{name}' timed out after {timeout:?}")]
    Timeout {
        name: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Connection '{0}' was closed by the peer")]
    ConnectionClosed(String),

    #[error("I/O error on '{name}': {message}")]
    Io { name: String, message: String },
}

impl From<IpcError> for DomainError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::NotConnected(name) => DomainError::NotConnected(name),
            IpcError::AlreadyConnected(name) => DomainError::AlreadyConnected(name),
            IpcError::Timeout { .. } => DomainError::Timeout(e.to_string()),
            IpcError::ConnectionClosed(_) | IpcError::Io { .. } => DomainError::Io(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binds the socket and waits for the peer (agent side)
    Listener,
    /// Connects to an existing socket, retrying until it appears (child side)
    Client,
}

pub struct IpcConnection {
    name: String,
    path: PathBuf,
    role: Role,
    timeout: Duration,
    connected: AtomicBool,
    listener: Mutex<Option<UnixListener>>,
    reader: Mutex<Option<FramedRead<OwnedReadHalf, LinesCodec>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl IpcConnection {
    pub fn listener(name: impl Into<String>, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new(name.into(), path.into(), Role::Listener, timeout)
    }

    pub fn client(name: impl Into<String>, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new(name.into(), path.into(), Role::Client, timeout)
    }

    fn new(name: String, path: PathBuf, role: Role, timeout: Duration) -> Self {
        Self {
            name,
            path,
            role,
            timeout,
            connected: AtomicBool::new(false),
            listener: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn io_error(&self, e: std::io::Error) -> IpcError {
        IpcError::Io {
            name: self.name.clone(),
            message: e.to_string(),
        }
    }

    fn timed_out(&self, operation: &'static str, timeout: Duration) -> IpcError {
        IpcError::Timeout {
            name: self.name.clone(),
            operation,
            timeout,
        }
    }

    /// Bind the socket ahead of `connect` so the peer can connect early.
    /// Replaces a stale socket file left by an earlier run. No-op for clients.
    pub async fn listen(&self) -> Result<(), IpcError> {
        if self.role != Role::Listener {
            return Ok(());
        }
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(connection = %self.name, "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.io_error(e)),
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        *listener = Some(UnixListener::bind(&self.path).map_err(|e| self.io_error(e))?);
        Ok(())
    }

    /// Wait for the peer, up to the connection timeout
    pub async fn connect(&self) -> Result<(), IpcError> {
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IpcError::AlreadyConnected(self.name.clone()));
        }

        let stream = match self.role {
            Role::Listener => self.accept().await,
            Role::Client => self.connect_client().await,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_MESSAGE_LENGTH),
        ));
        *self.writer.lock().await = Some(write_half);
        debug!(connection = %self.name, role = ?self.role, "Connected");
        Ok(())
    }

    async fn accept(&self) -> Result<UnixStream, IpcError> {
        self.listen().await?;
        let listener = self.listener.lock().await.take();
        let Some(listener) = listener else {
            return Err(IpcError::NotConnected(self.name.clone()));
        };

        let accepted = tokio::time::timeout(self.timeout, listener.accept()).await;
        // One peer per connection; later connects must fail fast
        let _ = std::fs::remove_file(&self.path);
        match accepted {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(self.timed_out("connect", self.timeout)),
        }
    }

    async fn connect_client(&self) -> Result<UnixStream, IpcError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => return Ok(stream),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    if tokio::time::Instant::now() + CLIENT_CONNECT_RETRY > deadline {
                        return Err(self.timed_out("connect", self.timeout));
                    }
                    tokio::time::sleep(CLIENT_CONNECT_RETRY).await;
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }
    }

    pub async fn send_message(&self, message: &str) -> Result<(), IpcError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(IpcError::NotConnected(self.name.clone()));
        };

        let line = format!("{}\n", message);
        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(self.timed_out("send", self.timeout)),
        }
    }

    pub async fn read_message(&self) -> Result<String, IpcError> {
        self.read_message_within(self.timeout).await
    }

    /// Read one line, waiting at most `timeout`
    pub async fn read_message_within(&self, timeout: Duration) -> Result<String, IpcError> {
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Err(IpcError::NotConnected(self.name.clone()));
        };

        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(line))) => Ok(line),
            Ok(None) => Err(IpcError::ConnectionClosed(self.name.clone())),
            Ok(Some(Err(LinesCodecError::Io(e)))) => Err(self.io_error(e)),
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => Err(IpcError::Io {
                name: self.name.clone(),
                message: format!("message longer than {} bytes", MAX_MESSAGE_LENGTH),
            }),
            Err(_) => Err(self.timed_out("read", timeout)),
        }
    }

    /// Drop the stream. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        let listener = self.listener.lock().await.take();
        if reader.is_some() || writer.is_some() {
            debug!(connection = %self.name, "Disconnected");
        }
        if listener.is_some() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(connection = %self.name, error = %e, "Failed to remove socket");
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(dir: &Path, name: &str) -> (IpcConnection, IpcConnection) {
        let path = dir.join(format!("{}.sock", name));
        (
            IpcConnection::listener(name, &path, Duration::from_secs(5)),
            IpcConnection::client(name, &path, Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn test_send_and_read_before_connect_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = pair(dir.path(), "init");

        assert_eq!(
            agent.send_message("[EXIT]").await,
            Err(IpcError::NotConnected("init".to_string()))
        );
        assert_eq!(
            agent.read_message().await,
            Err(IpcError::NotConnected("init".to_string()))
        );
    }

    #[tokio::test]
    async fn test_round_trip_and_double_connect() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, child) = pair(dir.path(), "init");

        let (a, c) = tokio::join!(agent.connect(), child.connect());
        a.unwrap();
        c.unwrap();
        assert_eq!(
            agent.connect().await,
            Err(IpcError::AlreadyConnected("init".to_string()))
        );

        child.send_message("[INITIALIZE_DONE]").await.unwrap();
        assert_eq!(agent.read_message().await.unwrap(), "[INITIALIZE_DONE]");

        agent.send_message("[EXIT]").await.unwrap();
        assert_eq!(child.read_message().await.unwrap(), "[EXIT]");
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_peer_sees_close() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, child) = pair(dir.path(), "health");
        let (a, c) = tokio::join!(agent.connect(), child.connect());
        a.unwrap();
        c.unwrap();

        child.disconnect().await;
        child.disconnect().await;

        assert_eq!(
            agent.read_message().await,
            Err(IpcError::ConnectionClosed("health".to_string()))
        );
        assert!(!child.is_connected());
        assert!(matches!(
            child.send_message("[HEALTH_OK]").await,
            Err(IpcError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, child) = pair(dir.path(), "health");
        let (a, c) = tokio::join!(agent.connect(), child.connect());
        a.unwrap();
        c.unwrap();

        let result = agent.read_message_within(Duration::from_millis(50)).await;

        assert!(matches!(result, Err(IpcError::Timeout { .. })));
        assert!(matches!(
            DomainError::from(result.unwrap_err()),
            DomainError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn test_line_split_across_a_read_timeout_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exit.sock");
        let child = IpcConnection::client("exit", &path, Duration::from_secs(5));
        let listener = UnixListener::bind(&path).unwrap();
        let (connected, accepted) = tokio::join!(child.connect(), listener.accept());
        connected.unwrap();
        let (mut agent, _) = accepted.unwrap();

        agent.write_all(b"[EX").await.unwrap();
        assert!(matches!(
            child.read_message_within(Duration::from_millis(100)).await,
            Err(IpcError::Timeout { .. })
        ));
        agent.write_all(b"IT]\r\n").await.unwrap();

        assert_eq!(child.read_message().await.unwrap(), "[EXIT]");
    }

    #[tokio::test]
    async fn test_listener_without_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exit.sock");
        let agent = IpcConnection::listener("exit", &path, Duration::from_millis(100));

        let result = agent.connect().await;

        assert!(matches!(result, Err(IpcError::Timeout { .. })));
        assert!(!agent.is_connected());
    }

    #[tokio::test]
    async fn test_client_waits_for_late_listener() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, child) = pair(dir.path(), "init");

        let child_task = tokio::spawn(async move {
            child.connect().await.unwrap();
            child.send_message("[INITIALIZE_DONE]").await.unwrap();
            child
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        agent.connect().await.unwrap();

        assert_eq!(agent.read_message().await.unwrap(), "[INITIALIZE_DONE]");
        let _child = child_task.await.unwrap();
    }
}
