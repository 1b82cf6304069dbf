//! Process port
//! Interface for supervising one OS child process

use crate::domain::{DomainError, ProcessState};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the exit-event channels; an exit fires once per run
pub const EXIT_EVENT_CAPACITY: usize = 16;

/// Event sent when a process terminates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// State the process landed in: `Exited` for spontaneous terminations,
    /// `Closed`/`Killed` when the caller asked for it
    pub state: ProcessState,
    pub reason: String,
}

impl ProcessExitEvent {
    pub fn is_unexpected(&self) -> bool {
        self.state == ProcessState::Exited
    }
}

/// Port for a supervised child process.
///
/// Lifecycle: Created -> Running -> (Exited | Killed | Closed) -> ResourcesReleased.
/// A terminated process may be started again until its resources are released.
#[async_trait]
pub trait Process: Send + Sync {
    fn exe_path(&self) -> &Path;

    fn exe_args(&self) -> &[String];

    /// OS pid while the process is alive
    fn pid(&self) -> Option<u32>;

    fn is_running(&self) -> bool;

    fn has_exited(&self) -> bool;

    /// Fails with `AlreadyRunning` while the process is alive
    async fn start(&self) -> Result<(), DomainError>;

    /// Cooperative shutdown request (SIGTERM); no-op when not running
    async fn close(&self) -> Result<(), DomainError>;

    /// Forced termination (SIGKILL); no-op when not running
    async fn kill(&self) -> Result<(), DomainError>;

    /// Free OS handles; fails with `StillRunning` while alive
    async fn release_resources(&self) -> Result<(), DomainError>;

    /// Exit notifications; subscribe before starting to observe the first run
    fn subscribe_exited(&self) -> broadcast::Receiver<ProcessExitEvent>;
}

/// Wait up to `timeout` for `process` to terminate. Returns whether it did.
pub async fn wait_for_exit(process: &dyn Process, timeout: Duration) -> bool {
    let mut exited = process.subscribe_exited();
    if process.has_exited() {
        return true;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, exited.recv()).await {
            Ok(Ok(_)) => return true,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                if process.has_exited() {
                    return true;
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                return process.has_exited();
            }
        }
    }
}
