//! Process-backed application
//!
//! An installed application is a `SelfRestartingProcess` around a `TokioProcess`,
//! plus the handshake channels its `app.yaml` enables:
//! - init: start waits for `[INITIALIZE_DONE]`
//! - health: a background task expects `[HEALTH_OK]` every interval
//! - exit: stop sends `[EXIT]` before falling back to signals
//!
//! Sockets are bound before the child is spawned. After a restart the child
//! reconnects to the same paths; every channel is accepted again in the background.

use crate::domain::ports::{
    wait_for_exit, Application, ApplicationExitEvent, ApplicationFactory, Process,
    ProcessExitEvent, EXIT_EVENT_CAPACITY,
};
use crate::domain::services::{ProcessStopper, SelfRestartingProcess};
use crate::domain::{AppIdentity, AppInstallConfig, DomainError};
use crate::infrastructure::config::{load_app_config, AppConfig};
use crate::infrastructure::ipc::{
    channel_path, request_exit, wait_for_heartbeat, wait_for_initialization, ChannelKind,
    IpcConnection, IpcError,
};
use crate::infrastructure::tokio_process::TokioProcess;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handshake settings of one application
#[derive(Debug, Clone, Copy)]
pub struct HandshakeSettings {
    pub initialization_timeout: Duration,
    pub health_check_interval: Duration,
    pub stop_grace: Duration,
}

#[derive(Default)]
struct Channels {
    init: Option<Arc<IpcConnection>>,
    health: Option<Arc<IpcConnection>>,
    exit: Option<Arc<IpcConnection>>,
}

impl Channels {
    fn all(&self) -> impl Iterator<Item = &Arc<IpcConnection>> {
        [&self.init, &self.health, &self.exit]
            .into_iter()
            .flatten()
    }
}

struct Background {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ProcessApplication {
    identity: AppIdentity,
    install_path: PathBuf,
    process: Arc<SelfRestartingProcess>,
    stopper: ProcessStopper,
    settings: HandshakeSettings,
    channels: Channels,
    stopping: Arc<AtomicBool>,
    exit_tx: broadcast::Sender<ApplicationExitEvent>,
    background: Mutex<Option<Background>>,
}

impl ProcessApplication {
    pub fn new(
        identity: AppIdentity,
        install_path: PathBuf,
        process: Arc<SelfRestartingProcess>,
        settings: HandshakeSettings,
    ) -> Self {
        let (exit_tx, _) = broadcast::channel(EXIT_EVENT_CAPACITY);
        Self {
            identity,
            install_path,
            process,
            stopper: ProcessStopper::new(settings.stop_grace),
            settings,
            channels: Channels::default(),
            stopping: Arc::new(AtomicBool::new(false)),
            exit_tx,
            background: Mutex::new(None),
        }
    }

    pub fn with_init_channel(mut self, connection: IpcConnection) -> Self {
        self.channels.init = Some(Arc::new(connection));
        self
    }

    pub fn with_health_channel(mut self, connection: IpcConnection) -> Self {
        self.channels.health = Some(Arc::new(connection));
        self
    }

    pub fn with_exit_channel(mut self, connection: IpcConnection) -> Self {
        self.channels.exit = Some(Arc::new(connection));
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn restart_count(&self) -> u32 {
        self.process.restart_count()
    }

    async fn bind_channels(&self) -> Result<(), DomainError> {
        for channel in self.channels.all() {
            channel.listen().await?;
        }
        Ok(())
    }

    async fn await_initialization(&self, init: &IpcConnection) -> Result<(), IpcError> {
        let timeout = self.settings.initialization_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        init.connect().await?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        wait_for_initialization(init, remaining).await
    }

    /// Stop background tasks, bring the process down and drop the sockets
    async fn teardown(&self) {
        if let Some(background) = self.background.lock().await.take() {
            background.token.cancel();
            for task in background.tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        warn!(app = %self.identity, error = %e, "Background task ended abnormally");
                    }
                }
            }
        }
        self.stopper.stop_process(self.process.as_ref()).await;
        for channel in self.channels.all() {
            channel.disconnect().await;
        }
    }

    async fn request_graceful_exit(&self, exit: &IpcConnection) {
        self.process.request_stop();
        match request_exit(exit).await {
            Ok(()) => {
                debug!(app = %self.identity, "Exit requested over IPC");
                if wait_for_exit(self.process.as_ref(), self.settings.stop_grace).await {
                    info!(app = %self.identity, "Application exited gracefully");
                } else {
                    warn!(
                        app = %self.identity,
                        grace_sec = self.settings.stop_grace.as_secs(),
                        "Application ignored exit request"
                    );
                }
            }
            Err(e) => warn!(app = %self.identity, error = %e, "Failed to send exit request"),
        }
    }
}

#[async_trait]
impl Application for ProcessApplication {
    fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    fn install_path(&self) -> &Path {
        &self.install_path
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }

    async fn start(&self) -> Result<(), DomainError> {
        if let Some(pid) = self.process.pid().filter(|_| self.process.is_running()) {
            return Err(DomainError::AlreadyRunning(pid));
        }
        self.stopping.store(false, Ordering::SeqCst);
        self.bind_channels().await?;

        let token = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(forward_exits(
            self.identity.clone(),
            self.process.subscribe_exited(),
            self.stopping.clone(),
            self.exit_tx.clone(),
            token.clone(),
        ))];

        info!(app = %self.identity, exe = %self.process.exe_path().display(), "Starting application");
        if let Err(e) = self.process.start().await {
            token.cancel();
            for channel in self.channels.all() {
                channel.disconnect().await;
            }
            return Err(e);
        }

        if let Some(init) = &self.channels.init {
            if let Err(e) = self.await_initialization(init).await {
                error!(app = %self.identity, error = %e, "Application did not initialize");
                self.stopping.store(true, Ordering::SeqCst);
                *self.background.lock().await = Some(Background { token, tasks });
                self.teardown().await;
                return Err(match e {
                    IpcError::Timeout { .. } => DomainError::Timeout(format!(
                        "{} did not report initialization within {}s",
                        self.identity,
                        self.settings.initialization_timeout.as_secs()
                    )),
                    other => other.into(),
                });
            }
            info!(app = %self.identity, "Application initialized");
            tasks.push(tokio::spawn(serve_reinitialization(
                self.identity.clone(),
                init.clone(),
                self.settings.initialization_timeout,
                token.clone(),
            )));
        }

        if let Some(health) = &self.channels.health {
            tasks.push(tokio::spawn(monitor_health(
                self.identity.clone(),
                health.clone(),
                self.settings.health_check_interval,
                token.clone(),
            )));
        }

        if let Some(exit) = &self.channels.exit {
            tasks.push(tokio::spawn(hold_exit_channel(
                self.identity.clone(),
                exit.clone(),
                token.clone(),
            )));
        }

        *self.background.lock().await = Some(Background { token, tasks });
        Ok(())
    }

    async fn stop(&self) -> Result<(), DomainError> {
        self.stopping.store(true, Ordering::SeqCst);
        info!(app = %self.identity, "Stopping application");

        if let Some(exit) = &self.channels.exit {
            if self.process.is_running() {
                self.request_graceful_exit(exit).await;
            }
        }
        self.teardown().await;
        Ok(())
    }

    fn subscribe_exited(&self) -> broadcast::Receiver<ApplicationExitEvent> {
        self.exit_tx.subscribe()
    }
}

/// Report exits nobody asked for
async fn forward_exits(
    identity: AppIdentity,
    mut exited: broadcast::Receiver<ProcessExitEvent>,
    stopping: Arc<AtomicBool>,
    exit_tx: broadcast::Sender<ApplicationExitEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = exited.recv() => event,
        };
        match event {
            Ok(event) if event.is_unexpected() && !stopping.load(Ordering::SeqCst) => {
                warn!(app = %identity, reason = %event.reason, "Application exited unexpectedly");
                let _ = exit_tx.send(ApplicationExitEvent {
                    identity: identity.clone(),
                    reason: event.reason,
                });
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Accept the init channel again for each restarted child
async fn serve_reinitialization(
    identity: AppIdentity,
    init: Arc<IpcConnection>,
    timeout: Duration,
    token: CancellationToken,
) {
    loop {
        init.disconnect().await;
        let handshake = async {
            init.connect().await?;
            wait_for_initialization(&init, timeout).await
        };
        tokio::select! {
            _ = token.cancelled() => return,
            result = handshake => match result {
                Ok(()) => info!(app = %identity, "Restarted application initialized"),
                Err(IpcError::Timeout { .. }) => {}
                Err(e) => debug!(app = %identity, error = %e, "Init channel closed"),
            }
        }
    }
}

/// Expect a heartbeat every `interval`; missed ones are logged, never acted upon
async fn monitor_health(
    identity: AppIdentity,
    health: Arc<IpcConnection>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            result = health.connect() => result,
        };
        if let Err(e) = connected {
            warn!(app = %identity, error = %e, "Health channel not connected");
            health.disconnect().await;
            continue;
        }

        loop {
            let beat = tokio::select! {
                _ = token.cancelled() => return,
                beat = wait_for_heartbeat(&health, interval) => beat,
            };
            match beat {
                Ok(()) => debug!(app = %identity, "Heartbeat received"),
                Err(IpcError::Timeout { .. }) => warn!(
                    app = %identity,
                    interval_sec = interval.as_secs(),
                    "Missed heartbeat"
                ),
                Err(e) => {
                    debug!(app = %identity, error = %e, "Health channel closed");
                    break;
                }
            }
        }
        health.disconnect().await;
    }
}

/// Keep the exit channel accepted so stop can write to the current child
async fn hold_exit_channel(identity: AppIdentity, exit: Arc<IpcConnection>, token: CancellationToken) {
    loop {
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            result = exit.connect() => result,
        };
        match connected {
            Ok(()) => debug!(app = %identity, "Exit channel connected"),
            Err(IpcError::Timeout { .. }) => {
                exit.disconnect().await;
                continue;
            }
            Err(e) => {
                warn!(app = %identity, error = %e, "Exit channel not connected");
                exit.disconnect().await;
                continue;
            }
        }

        // The child never writes; a read only returns once it hangs up
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => return,
                read = exit.read_message() => read,
            };
            match read {
                Err(IpcError::Timeout { .. }) => continue,
                Ok(line) => debug!(app = %identity, received = %line, "Ignoring message on exit channel"),
                Err(_) => break,
            }
        }
        exit.disconnect().await;
    }
}

/// Replace `${Id}`, `${Version}`, `${Version.Major}`, `${Version.Minor}`,
/// `${Version.Patch}` and `${<property>}`. Unknown placeholders are kept verbatim.
pub fn expand_placeholders(template: &str, config: &AppInstallConfig) -> String {
    let identity = config.identity();
    let version = identity.version();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        let value = match name {
            "Id" => Some(identity.id().to_string()),
            "Version" => Some(version.to_string()),
            "Version.Major" => Some(version.major().to_string()),
            "Version.Minor" => Some(version.minor().to_string()),
            "Version.Patch" => Some(version.patch().to_string()),
            property => config.property(property).map(str::to_string),
        };
        match value {
            Some(value) => out.push_str(&value),
            None => {
                debug!(app = %identity, placeholder = %name, "Unknown placeholder left as is");
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Builds `ProcessApplication`s from `app.yaml` in the install directory
pub struct ProcessApplicationFactory {
    ipc_dir: PathBuf,
    stop_grace: Duration,
}

impl ProcessApplicationFactory {
    pub fn new(ipc_dir: impl Into<PathBuf>, stop_grace: Duration) -> Self {
        Self {
            ipc_dir: ipc_dir.into(),
            stop_grace,
        }
    }

    fn channel(
        &self,
        prefix: &str,
        kind: ChannelKind,
        timeout: Duration,
        env: &mut Vec<(String, String)>,
    ) -> IpcConnection {
        let path = channel_path(&self.ipc_dir, prefix, kind);
        env.push((kind.env_var().to_string(), path.display().to_string()));
        IpcConnection::listener(kind.suffix(), path, timeout)
    }

    fn build(
        &self,
        config: &AppInstallConfig,
        app_config: AppConfig,
        install_path: &Path,
    ) -> ProcessApplication {
        let identity = config.identity().clone();
        let prefix = format!("{}-{}", identity.id(), identity.version());
        let settings = HandshakeSettings {
            initialization_timeout: app_config.initialization_timeout(),
            health_check_interval: app_config.health_check_interval(),
            stop_grace: self.stop_grace,
        };

        let mut env: Vec<(String, String)> = app_config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_placeholders(v, config)))
            .collect();
        let init = app_config.monitor_initialization.then(|| {
            self.channel(&prefix, ChannelKind::Init, settings.initialization_timeout, &mut env)
        });
        let health = app_config.monitor_health.then(|| {
            self.channel(&prefix, ChannelKind::Health, settings.health_check_interval, &mut env)
        });
        let exit = app_config.graceful_shutdown.then(|| {
            self.channel(&prefix, ChannelKind::Exit, settings.initialization_timeout, &mut env)
        });

        let args = app_config
            .exe_args
            .iter()
            .map(|arg| expand_placeholders(arg, config))
            .collect();
        let process = TokioProcess::new(install_path.join(&app_config.exe_name), args)
            .with_working_dir(install_path)
            .with_envs(env)
            .with_output(app_config.stdout.clone(), app_config.stderr.clone());
        let process = Arc::new(SelfRestartingProcess::new(
            Arc::new(process),
            app_config.max_restart_attempts,
        ));

        let mut application =
            ProcessApplication::new(identity, install_path.to_path_buf(), process, settings);
        if let Some(init) = init {
            application = application.with_init_channel(init);
        }
        if let Some(health) = health {
            application = application.with_health_channel(health);
        }
        if let Some(exit) = exit {
            application = application.with_exit_channel(exit);
        }
        application
    }
}

#[async_trait]
impl ApplicationFactory for ProcessApplicationFactory {
    async fn create_application(
        &self,
        config: &AppInstallConfig,
        install_path: &Path,
    ) -> Result<Arc<dyn Application>, DomainError> {
        let app_config = load_app_config(install_path).await?;
        debug!(
            app = %config.identity(),
            exe = %app_config.exe_name,
            monitor_initialization = app_config.monitor_initialization,
            monitor_health = app_config.monitor_health,
            graceful_shutdown = app_config.graceful_shutdown,
            "Creating application"
        );
        Ok(Arc::new(self.build(config, app_config, install_path)))
    }
}
