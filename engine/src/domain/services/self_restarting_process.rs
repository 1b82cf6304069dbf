//! Self-restarting process
//! Decorator that restarts the wrapped process when it exits on its own,
//! and reports an exit only once it gives up.

use crate::domain::ports::{wait_for_exit, Process, ProcessExitEvent, EXIT_EVENT_CAPACITY};
use crate::domain::{DomainError, ProcessState};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a restart that raced with a stop waits for its kill to land
const RESTART_KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RestartState {
    restart_count: AtomicU32,
    stop_requested: AtomicBool,
    gave_up: AtomicBool,
    /// Held across the stop check and the restart; releasing resources waits for it
    restart_gate: tokio::sync::Mutex<()>,
}

pub struct SelfRestartingProcess {
    inner: Arc<dyn Process>,
    max_restart_attempts: u32,
    state: Arc<RestartState>,
    exit_tx: broadcast::Sender<ProcessExitEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SelfRestartingProcess {
    pub fn new(inner: Arc<dyn Process>, max_restart_attempts: u32) -> Self {
        let (exit_tx, _) = broadcast::channel(EXIT_EVENT_CAPACITY);
        Self {
            inner,
            max_restart_attempts,
            state: Arc::new(RestartState::default()),
            exit_tx,
            monitor: Mutex::new(None),
        }
    }

    /// Restarts performed since the last explicit start
    pub fn restart_count(&self) -> u32 {
        self.state.restart_count.load(Ordering::SeqCst)
    }

    pub fn max_restart_attempts(&self) -> u32 {
        self.max_restart_attempts
    }

    /// Treat the next exit as requested, e.g. before asking the child to quit over IPC
    pub fn request_stop(&self) {
        self.state.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Subscribe to the wrapped process before it runs so no exit is missed
    fn ensure_monitor(&self) {
        let mut monitor = match self.monitor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let exited = self.inner.subscribe_exited();
        let inner = self.inner.clone();
        let state = self.state.clone();
        let exit_tx = self.exit_tx.clone();
        let max = self.max_restart_attempts;
        *monitor = Some(tokio::spawn(async move {
            supervise(inner, state, exit_tx, max, exited).await;
        }));
    }

    fn abort_monitor(&self) {
        let handle = match self.monitor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Handle exit events one at a time so at most one restart is in flight
async fn supervise(
    inner: Arc<dyn Process>,
    state: Arc<RestartState>,
    exit_tx: broadcast::Sender<ProcessExitEvent>,
    max_restart_attempts: u32,
    mut exited: broadcast::Receiver<ProcessExitEvent>,
) {
    let exe = inner.exe_path().display().to_string();
    loop {
        let event = match exited.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(process = %exe, skipped = skipped, "Missed exit notifications");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if state.stop_requested.load(Ordering::SeqCst) {
            debug!(process = %exe, state = %event.state, "Requested stop completed");
            let _ = exit_tx.send(event);
            continue;
        }

        let attempt = state.restart_count.load(Ordering::SeqCst);
        if attempt >= max_restart_attempts {
            error!(
                process = %exe,
                restarts = attempt,
                reason = %event.reason,
                "Restart limit reached, giving up"
            );
            give_up(&state, &exit_tx, event, "restart limit reached");
            return;
        }

        state.restart_count.store(attempt + 1, Ordering::SeqCst);
        warn!(
            process = %exe,
            attempt = attempt + 1,
            max_attempts = max_restart_attempts,
            reason = %event.reason,
            "Process exited unexpectedly, restarting"
        );

        let _gate = state.restart_gate.lock().await;
        if state.stop_requested.load(Ordering::SeqCst) {
            continue;
        }
        match inner.start().await {
            Ok(()) if state.stop_requested.load(Ordering::SeqCst) => {
                warn!(process = %exe, pid = ?inner.pid(), "Stop requested during restart, killing");
                if let Err(e) = inner.kill().await {
                    error!(process = %exe, error = %e, "Failed to kill restarted process");
                }
                if !wait_for_exit(inner.as_ref(), RESTART_KILL_TIMEOUT).await {
                    warn!(process = %exe, "Restarted process still running after kill");
                }
            }
            Ok(()) => info!(process = %exe, pid = ?inner.pid(), "Process restarted"),
            Err(e) => {
                error!(process = %exe, error = %e, "Restart failed, giving up");
                give_up(&state, &exit_tx, event, &format!("restart failed: {}", e));
                return;
            }
        }
    }
}

fn give_up(
    state: &RestartState,
    exit_tx: &broadcast::Sender<ProcessExitEvent>,
    last: ProcessExitEvent,
    why: &str,
) {
    state.gave_up.store(true, Ordering::SeqCst);
    let _ = exit_tx.send(ProcessExitEvent {
        pid: last.pid,
        exit_code: last.exit_code,
        state: ProcessState::Exited,
        reason: format!("{} ({})", last.reason, why),
    });
}

#[async_trait]
impl Process for SelfRestartingProcess {
    fn exe_path(&self) -> &Path {
        self.inner.exe_path()
    }

    fn exe_args(&self) -> &[String] {
        self.inner.exe_args()
    }

    fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    fn is_running(&self) -> bool {
        !self.state.gave_up.load(Ordering::SeqCst) && self.inner.is_running()
    }

    fn has_exited(&self) -> bool {
        self.state.gave_up.load(Ordering::SeqCst)
            || (self.state.stop_requested.load(Ordering::SeqCst) && self.inner.has_exited())
    }

    async fn start(&self) -> Result<(), DomainError> {
        self.state.stop_requested.store(false, Ordering::SeqCst);
        self.state.gave_up.store(false, Ordering::SeqCst);
        self.state.restart_count.store(0, Ordering::SeqCst);
        self.ensure_monitor();
        self.inner.start().await
    }

    async fn close(&self) -> Result<(), DomainError> {
        self.state.stop_requested.store(true, Ordering::SeqCst);
        self.inner.close().await
    }

    async fn kill(&self) -> Result<(), DomainError> {
        self.state.stop_requested.store(true, Ordering::SeqCst);
        self.inner.kill().await
    }

    async fn release_resources(&self) -> Result<(), DomainError> {
        self.state.stop_requested.store(true, Ordering::SeqCst);
        {
            let _gate = self.state.restart_gate.lock().await;
            self.abort_monitor();
        }
        self.inner.release_resources().await
    }

    fn subscribe_exited(&self) -> broadcast::Receiver<ProcessExitEvent> {
        self.exit_tx.subscribe()
    }
}

impl Drop for SelfRestartingProcess {
    fn drop(&mut self) {
        self.abort_monitor();
    }
}
