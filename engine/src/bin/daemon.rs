//! deployerd: keeps this instance's applications in line with the deployment manifest

#[path = "daemon/config.rs"]
mod config;

use config::{DaemonConfig, LeaseBackend};
use deployer_engine::domain::ports::{
    ApplicationDownloader, ApplicationFactory, DeploymentDirectory, DeploymentRepository,
    LeaseStore, UpdateSessionManager,
};
use deployer_engine::domain::services::{
    ApplicationPool, ClusterIdMatcher, ClusterPropertiesMatcher, DeploymentMatcher,
    DeploymentWatcher, LeaseUpdateSessionManager,
};
use deployer_engine::domain::use_cases::{
    ApplicationInstaller, ApplicationUpdateManager, CheckForUpdatesUseCase,
    InstallApplicationUseCase,
};
use deployer_engine::infrastructure::{
    get_default_config_path, load_config_from_path, AgentConfig, FileLeaseStore,
    InMemoryLeaseStore, LocalDeploymentRepository, ProcessApplicationFactory,
    RepositoryApplicationDownloader, RepositoryDeploymentDirectory,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LEASES_DIR: &str = "leases";

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn load_agent_config(daemon_config: &DaemonConfig) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let mut config = match daemon_config.config_file.clone().or_else(get_default_config_path) {
        Some(path) => {
            info!(path = %path.display(), "Loading agent configuration");
            load_config_from_path(&path)?
        }
        None => {
            info!("No configuration file, using defaults and environment");
            AgentConfig::default()
        }
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

struct Agent {
    pool: Arc<ApplicationPool>,
    watcher: DeploymentWatcher,
}

fn build_agent(config: &AgentConfig, lease_backend: &LeaseBackend) -> Result<Agent, Box<dyn std::error::Error>> {
    let repository: Arc<dyn DeploymentRepository> =
        Arc::new(LocalDeploymentRepository::new(&config.repository_root));

    let matcher: Arc<dyn DeploymentMatcher> = if config.cluster_properties.is_empty() {
        Arc::new(ClusterIdMatcher::new(&config.cluster_id))
    } else {
        Arc::new(ClusterPropertiesMatcher::new(
            &config.cluster_id,
            config.cluster_properties.clone(),
        ))
    };
    let directory: Arc<dyn DeploymentDirectory> =
        Arc::new(RepositoryDeploymentDirectory::new(repository.clone(), matcher));
    let downloader: Arc<dyn ApplicationDownloader> = Arc::new(
        RepositoryApplicationDownloader::new(repository, &config.applications_root),
    );

    let lease_store: Arc<dyn LeaseStore> = match lease_backend {
        LeaseBackend::File => Arc::new(FileLeaseStore::new(config.repository_root.join(LEASES_DIR))),
        LeaseBackend::Memory => {
            warn!("Using in-memory leases; update domains are not coordinated across instances");
            Arc::new(InMemoryLeaseStore::new())
        }
    };
    let sessions: Arc<dyn UpdateSessionManager> = Arc::new(LeaseUpdateSessionManager::new(
        lease_store,
        &config.cluster_id,
        &config.update_domain,
        config.lease_settings()?,
    )?);

    let pool = Arc::new(ApplicationPool::new());
    let factory: Arc<dyn ApplicationFactory> =
        Arc::new(ProcessApplicationFactory::new(&config.ipc_dir, config.stop_grace()));
    let installer: Arc<dyn ApplicationInstaller> = Arc::new(InstallApplicationUseCase::new(
        &config.applications_root,
        pool.clone(),
        factory,
        sessions,
    ));
    let update_manager: Arc<dyn ApplicationUpdateManager> = Arc::new(CheckForUpdatesUseCase::new(
        directory,
        downloader,
        pool.clone(),
        installer,
    ));

    Ok(Agent {
        pool,
        watcher: DeploymentWatcher::new(update_manager, config.check_interval()),
    })
}

/// Log unexpected application exits; the next cycle does not reinstall them on its own
fn spawn_exit_logger(pool: &ApplicationPool) {
    let mut exited = pool.subscribe_exited();
    tokio::spawn(async move {
        loop {
            match exited.recv().await {
                Ok(event) => error!(
                    app = %event.identity,
                    reason = %event.reason,
                    "Application stopped unexpectedly"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Missed application exit notifications")
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM"),
        _ = interrupt.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let daemon_config = DaemonConfig::from_env();
    init_tracing(&daemon_config.log_level);
    daemon_config.validate()?;

    let config = load_agent_config(&daemon_config)?;
    info!(
        cluster_id = %config.cluster_id,
        instance_id = %config.instance_id,
        update_domain = %config.update_domain,
        repository = %config.repository_root.display(),
        applications = %config.applications_root.display(),
        "Starting deployer"
    );

    let agent = build_agent(&config, &daemon_config.lease_backend)?;
    spawn_exit_logger(&agent.pool);
    agent.watcher.start().await;

    if let Err(e) = shutdown_signal().await {
        error!(error = %e, "Failed to install signal handlers, shutting down");
    }

    agent.watcher.stop().await;
    if let Err(e) = agent.pool.shutdown().await {
        error!(error = %e, "Some applications did not stop cleanly");
    }
    info!("Deployer stopped");
    Ok(())
}
