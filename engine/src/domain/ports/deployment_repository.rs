//! Deployment repository port
//! Shared storage holding application binaries and the deployment manifest

use crate::domain::{AppDeploymentConfig, AppIdentity, ConflictMode, DeploymentConfig, DomainError};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn has_application_binaries(&self, identity: &AppIdentity) -> Result<bool, DomainError>;

    /// Copy the binaries of `identity` into `destination`.
    /// Fails with `BinariesNotFound` when the repository has none.
    async fn download_application_binaries(
        &self,
        identity: &AppIdentity,
        destination: &Path,
        conflict_mode: ConflictMode,
    ) -> Result<(), DomainError>;

    /// Publish binaries from `source`.
    /// Fails with `DuplicateBinaries` under `FailIfExists` when they already exist.
    async fn upload_application_binaries(
        &self,
        identity: &AppIdentity,
        source: &Path,
        conflict_mode: ConflictMode,
    ) -> Result<(), DomainError>;

    async fn delete_application_binaries(&self, identity: &AppIdentity) -> Result<(), DomainError>;

    /// Current manifest; `DeploymentConfigNotFound` when none was ever published
    async fn fetch_deployment_config(&self) -> Result<DeploymentConfig, DomainError>;

    async fn publish_deployment_config(&self, config: &DeploymentConfig) -> Result<(), DomainError>;
}

/// Port for the desired application set of this instance
#[async_trait]
pub trait DeploymentDirectory: Send + Sync {
    /// Deployments targeting this instance's cluster
    async fn fetch_deployments(&self) -> Result<Vec<AppDeploymentConfig>, DomainError>;
}

/// Port for fetching binaries to the local install location
#[async_trait]
pub trait ApplicationDownloader: Send + Sync {
    async fn download_application(&self, identity: &AppIdentity) -> Result<(), DomainError>;
}
