//! Application port
//! A deployed application backed by a running process, and the factory that materializes it

use crate::domain::{AppIdentity, AppInstallConfig, DomainError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Sent when an application stops without being asked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationExitEvent {
    pub identity: AppIdentity,
    pub reason: String,
}

#[async_trait]
pub trait Application: Send + Sync {
    fn identity(&self) -> &AppIdentity;

    fn install_path(&self) -> &Path;

    fn is_running(&self) -> bool;

    async fn start(&self) -> Result<(), DomainError>;

    async fn stop(&self) -> Result<(), DomainError>;

    /// Unexpected exits only; requested stops are not reported
    fn subscribe_exited(&self) -> broadcast::Receiver<ApplicationExitEvent>;
}

/// Port for creating applications from installed binaries
#[async_trait]
pub trait ApplicationFactory: Send + Sync {
    /// Build an application from the binaries at `install_path`.
    /// The returned application is not started yet.
    async fn create_application(
        &self,
        config: &AppInstallConfig,
        install_path: &Path,
    ) -> Result<Arc<dyn Application>, DomainError>;
}
