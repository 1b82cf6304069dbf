//! Process Stopper
//! Close, wait, kill, wait, release. Never fails the caller.

use crate::domain::constants::DEFAULT_STOP_GRACE_SEC;
use crate::domain::ports::{wait_for_exit, Process};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ProcessStopper {
    close_timeout: Duration,
    kill_timeout: Duration,
}

impl Default for ProcessStopper {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_STOP_GRACE_SEC))
    }
}

impl ProcessStopper {
    pub fn new(grace: Duration) -> Self {
        Self {
            close_timeout: grace,
            kill_timeout: grace,
        }
    }

    pub fn with_timeouts(close_timeout: Duration, kill_timeout: Duration) -> Self {
        Self {
            close_timeout,
            kill_timeout,
        }
    }

    /// Bring `process` down and free its resources.
    ///
    /// Failures of the individual steps are logged; resources are released
    /// exactly once whatever happened before.
    pub async fn stop_process(&self, process: &dyn Process) {
        let exe = process.exe_path().display().to_string();

        if process.has_exited() || process.pid().is_none() {
            debug!(process = %exe, "Process not alive, releasing resources");
        } else {
            self.terminate(process, &exe).await;
        }

        if let Err(e) = process.release_resources().await {
            error!(process = %exe, error = %e, "Failed to release process resources");
        }
    }

    async fn terminate(&self, process: &dyn Process, exe: &str) {
        info!(process = %exe, pid = ?process.pid(), "Closing process");
        if let Err(e) = process.close().await {
            warn!(process = %exe, error = %e, "Close request failed");
        }

        if wait_for_exit(process, self.close_timeout).await {
            debug!(process = %exe, "Process exited after close");
            return;
        }

        warn!(
            process = %exe,
            timeout_ms = self.close_timeout.as_millis() as u64,
            "Process did not exit after close, killing"
        );
        if let Err(e) = process.kill().await {
            warn!(process = %exe, error = %e, "Kill request failed");
        }

        if !wait_for_exit(process, self.kill_timeout).await {
            error!(
                process = %exe,
                timeout_ms = self.kill_timeout.as_millis() as u64,
                "Process still alive after kill"
            );
        }
    }
}
