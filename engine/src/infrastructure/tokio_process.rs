//! Tokio Process
//! Real implementation of the Process port on top of tokio::process
//!
//! Close sends SIGTERM, kill sends SIGKILL. A watcher task reaps the child
//! and publishes exactly one exit event per run.

use crate::domain::ports::{Process, ProcessExitEvent, EXIT_EVENT_CAPACITY};
use crate::domain::{DomainError, ProcessState};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Close,
    Kill,
}

#[derive(Default)]
struct RunState {
    state: ProcessState,
    pid: Option<u32>,
    stop: Option<StopRequest>,
    /// Incremented on every start so a stale watcher cannot clobber a newer run
    run: u64,
    watcher: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Directory the child runs in unless told otherwise
pub fn default_working_dir(exe_path: &Path) -> PathBuf {
    exe_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configure stdout/stderr redirection: unset or "inherit", "null", or a file path to append to
fn configure_output(output: Option<&str>) -> Result<Stdio, DomainError> {
    match output {
        None | Some("inherit") => Ok(Stdio::inherit()),
        Some("null") => Ok(Stdio::null()),
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    DomainError::InvalidConfiguration(format!(
                        "Failed to open output file '{}': {}",
                        path, e
                    ))
                })?;
            Ok(Stdio::from(file))
        }
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(signal)) => format!("terminated by signal {}", signal),
        (None, None) => "exited".to_string(),
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), DomainError> {
    let raw = i32::try_from(pid)
        .map_err(|_| DomainError::ProcessFailed(format!("invalid pid {}", pid)))?;
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => {
            debug!(pid = pid, signal = ?sig, "Signal sent successfully");
            Ok(())
        }
        // Already gone, the watcher will report it
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(DomainError::ProcessFailed(format!(
            "failed to send {:?} to PID {}: {}",
            sig, pid, e
        ))),
    }
}

pub struct TokioProcess {
    exe_path: PathBuf,
    exe_args: Vec<String>,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    stdout: Option<String>,
    stderr: Option<String>,
    run_state: Arc<Mutex<RunState>>,
    exit_tx: broadcast::Sender<ProcessExitEvent>,
}

impl TokioProcess {
    pub fn new(exe_path: impl Into<PathBuf>, exe_args: Vec<String>) -> Self {
        let exe_path = exe_path.into();
        let (exit_tx, _) = broadcast::channel(EXIT_EVENT_CAPACITY);
        Self {
            working_dir: default_working_dir(&exe_path),
            exe_path,
            exe_args,
            env: Vec::new(),
            stdout: None,
            stderr: None,
            run_state: Arc::new(Mutex::new(RunState::default())),
            exit_tx,
        }
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_output(mut self, stdout: Option<String>, stderr: Option<String>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.run_state).state
    }

    fn request_stop(&self, request: StopRequest) -> Option<u32> {
        let mut run = lock(&self.run_state);
        if run.state != ProcessState::Running {
            return None;
        }
        if run.stop != Some(StopRequest::Kill) {
            run.stop = Some(request);
        }
        run.pid
    }

    fn spawn_watcher(&self, mut child: tokio::process::Child, run_id: u64) -> JoinHandle<()> {
        let run_state = self.run_state.clone();
        let exit_tx = self.exit_tx.clone();
        let exe = self.exe_path.display().to_string();
        tokio::spawn(async move {
            let waited = child.wait().await;
            let event = {
                let mut run = lock(&run_state);
                if run.run != run_id {
                    return;
                }
                let state = match run.stop {
                    Some(StopRequest::Close) => ProcessState::Closed,
                    Some(StopRequest::Kill) => ProcessState::Killed,
                    None => ProcessState::Exited,
                };
                let (exit_code, reason) = match &waited {
                    Ok(status) => (status.code(), describe_exit(status)),
                    Err(e) => (None, format!("wait failed: {}", e)),
                };
                let event = ProcessExitEvent {
                    pid: run.pid,
                    exit_code,
                    state,
                    reason,
                };
                run.state = state;
                run.pid = None;
                event
            };

            if event.is_unexpected() {
                warn!(process = %exe, pid = ?event.pid, reason = %event.reason, "Process exited");
            } else {
                info!(process = %exe, pid = ?event.pid, state = %event.state, reason = %event.reason, "Process stopped");
            }
            let _ = exit_tx.send(event);
        })
    }
}

#[async_trait]
impl Process for TokioProcess {
    fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    fn exe_args(&self) -> &[String] {
        &self.exe_args
    }

    fn pid(&self) -> Option<u32> {
        lock(&self.run_state).pid
    }

    fn is_running(&self) -> bool {
        lock(&self.run_state).state == ProcessState::Running
    }

    fn has_exited(&self) -> bool {
        lock(&self.run_state).state.has_terminated()
    }

    async fn start(&self) -> Result<(), DomainError> {
        let mut run = lock(&self.run_state);
        match run.state {
            ProcessState::Running => return Err(DomainError::AlreadyRunning(run.pid.unwrap_or(0))),
            state if !state.can_transition_to(ProcessState::Running) => {
                return Err(DomainError::InvalidStateTransition {
                    from: state.to_string(),
                    to: ProcessState::Running.to_string(),
                })
            }
            _ => {}
        }

        let mut command = Command::new(&self.exe_path);
        command
            .args(&self.exe_args)
            .current_dir(&self.working_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(configure_output(self.stdout.as_deref())?)
            .stderr(configure_output(self.stderr.as_deref())?);

        let child = command.spawn().map_err(|e| {
            DomainError::ProcessFailed(format!(
                "failed to spawn '{}': {}",
                self.exe_path.display(),
                e
            ))
        })?;

        run.run += 1;
        run.state = ProcessState::Running;
        run.pid = child.id();
        run.stop = None;
        let run_id = run.run;
        info!(
            process = %self.exe_path.display(),
            pid = ?run.pid,
            args = ?self.exe_args,
            "Process started"
        );
        run.watcher = Some(self.spawn_watcher(child, run_id));
        Ok(())
    }

    async fn close(&self) -> Result<(), DomainError> {
        match self.request_stop(StopRequest::Close) {
            Some(pid) => send_signal(pid, Signal::SIGTERM),
            None => Ok(()),
        }
    }

    async fn kill(&self) -> Result<(), DomainError> {
        match self.request_stop(StopRequest::Kill) {
            Some(pid) => send_signal(pid, Signal::SIGKILL),
            None => Ok(()),
        }
    }

    async fn release_resources(&self) -> Result<(), DomainError> {
        let mut run = lock(&self.run_state);
        match run.state {
            ProcessState::Running => Err(DomainError::StillRunning(run.pid.unwrap_or(0))),
            ProcessState::ResourcesReleased => Ok(()),
            _ => {
                run.state = ProcessState::ResourcesReleased;
                run.watcher = None;
                debug!(process = %self.exe_path.display(), "Process resources released");
                Ok(())
            }
        }
    }

    fn subscribe_exited(&self) -> broadcast::Receiver<ProcessExitEvent> {
        self.exit_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::wait_for_exit;
    use std::time::Duration;

    fn sh(script: &str) -> TokioProcess {
        TokioProcess::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_default_working_dir_is_exe_dir() {
        assert_eq!(
            default_working_dir(Path::new("/opt/apps/web/1.0.0/web")),
            PathBuf::from("/opt/apps/web/1.0.0")
        );
        assert_eq!(default_working_dir(Path::new("web")), PathBuf::from("."));
    }

    #[tokio::test]
    async fn test_start_twice_fails_with_already_running() {
        let process = TokioProcess::new("/bin/sleep", vec!["30".to_string()]);
        process.start().await.unwrap();
        assert!(process.is_running());
        assert!(process.pid().is_some());

        let result = process.start().await;
        assert!(matches!(result, Err(DomainError::AlreadyRunning(_))));

        process.kill().await.unwrap();
        assert!(wait_for_exit(&process, Duration::from_secs(5)).await);
        process.release_resources().await.unwrap();
    }

    #[tokio::test]
    async fn test_spontaneous_exit_reports_code() {
        let process = sh("exit 3");
        let mut exited = process.subscribe_exited();
        process.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), exited.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.exit_code, Some(3));
        assert_eq!(event.state, ProcessState::Exited);
        assert!(event.is_unexpected());
        assert!(!process.is_running());
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_close_terminates_with_sigterm() {
        let process = TokioProcess::new("/bin/sleep", vec!["30".to_string()]);
        let mut exited = process.subscribe_exited();
        process.start().await.unwrap();

        process.close().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), exited.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.state, ProcessState::Closed);
        assert!(event.reason.contains("signal 15"));
        process.release_resources().await.unwrap();
        assert_eq!(process.state(), ProcessState::ResourcesReleased);
    }

    #[tokio::test]
    async fn test_release_while_running_fails() {
        let process = TokioProcess::new("/bin/sleep", vec!["30".to_string()]);
        process.start().await.unwrap();

        let result = process.release_resources().await;
        assert!(matches!(result, Err(DomainError::StillRunning(_))));

        process.kill().await.unwrap();
        assert!(wait_for_exit(&process, Duration::from_secs(5)).await);
        assert_eq!(process.state(), ProcessState::Killed);
    }

    #[tokio::test]
    async fn test_close_and_kill_before_start_are_noops() {
        let process = TokioProcess::new("/bin/sleep", vec!["30".to_string()]);
        process.close().await.unwrap();
        process.kill().await.unwrap();
        assert!(!process.has_exited());
        process.release_resources().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_exit() {
        let process = sh("exit 0");
        process.start().await.unwrap();
        assert!(wait_for_exit(&process, Duration::from_secs(5)).await);

        process.start().await.unwrap();
        assert!(wait_for_exit(&process, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_start_after_release_is_rejected() {
        let process = sh("exit 0");
        process.release_resources().await.unwrap();

        let result = process.start().await;
        assert!(matches!(result, Err(DomainError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let process = TokioProcess::new("/nonexistent/command", vec![]);
        let result = process.start().await;
        assert!(matches!(result, Err(DomainError::ProcessFailed(_))));
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_env_and_working_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let process = sh("echo \"$GREETING\" > marker")
            .with_working_dir(dir.path())
            .with_env("GREETING", "hello");
        process.start().await.unwrap();
        assert!(wait_for_exit(&process, Duration::from_secs(5)).await);

        let marker = std::fs::read_to_string(dir.path().join("marker")).unwrap();
        assert_eq!(marker.trim(), "hello");
    }
}
