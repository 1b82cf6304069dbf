//! Deployment directory and application downloader backed by the deployment repository

use crate::domain::ports::{ApplicationDownloader, DeploymentDirectory, DeploymentRepository};
use crate::domain::services::DeploymentMatcher;
use crate::domain::use_cases::install_path;
use crate::domain::{AppDeploymentConfig, AppIdentity, ConflictMode, DomainError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Desired application set of this instance: the manifest filtered by a matcher
pub struct RepositoryDeploymentDirectory {
    repository: Arc<dyn DeploymentRepository>,
    matcher: Arc<dyn DeploymentMatcher>,
}

impl RepositoryDeploymentDirectory {
    pub fn new(repository: Arc<dyn DeploymentRepository>, matcher: Arc<dyn DeploymentMatcher>) -> Self {
        Self { repository, matcher }
    }
}

#[async_trait]
impl DeploymentDirectory for RepositoryDeploymentDirectory {
    async fn fetch_deployments(&self) -> Result<Vec<AppDeploymentConfig>, DomainError> {
        let config = match self.repository.fetch_deployment_config().await {
            Ok(config) => config,
            Err(DomainError::DeploymentConfigNotFound(location)) => {
                info!(location = %location, "No deployment config published yet, nothing to deploy");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let deployments: Vec<AppDeploymentConfig> = config
            .apps()
            .filter(|app| self.matcher.matches(app))
            .cloned()
            .collect();
        debug!(
            total = config.apps().count(),
            matching = deployments.len(),
            "Fetched deployments"
        );
        Ok(deployments)
    }
}

/// Copies binaries to `{applications_root}/{id}/{version}`, the path the installer starts from
pub struct RepositoryApplicationDownloader {
    repository: Arc<dyn DeploymentRepository>,
    applications_root: PathBuf,
}

impl RepositoryApplicationDownloader {
    pub fn new(repository: Arc<dyn DeploymentRepository>, applications_root: impl Into<PathBuf>) -> Self {
        Self {
            repository,
            applications_root: applications_root.into(),
        }
    }
}

#[async_trait]
impl ApplicationDownloader for RepositoryApplicationDownloader {
    async fn download_application(&self, identity: &AppIdentity) -> Result<(), DomainError> {
        let destination = install_path(&self.applications_root, identity);
        self.repository
            .download_application_binaries(identity, &destination, ConflictMode::OverwriteExisting)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::services::ClusterIdMatcher;
    use crate::domain::DeploymentConfig;
    use crate::infrastructure::local_deployment_repository::LocalDeploymentRepository;

    fn identity(id: &str, version: &str) -> AppIdentity {
        AppIdentity::parse(id, version).unwrap()
    }

    #[tokio::test]
    async fn test_missing_manifest_is_empty_desired_set() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(LocalDeploymentRepository::new(dir.path()));
        let directory =
            RepositoryDeploymentDirectory::new(repository, Arc::new(ClusterIdMatcher::new("prod")));

        assert!(directory.fetch_deployments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_matching_deployments_are_returned() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(LocalDeploymentRepository::new(dir.path()));
        let config = DeploymentConfig::new()
            .add_application(identity("web", "1.0.0"), "prod")
            .add_application(identity("api", "2.0.0"), "staging")
            .add_application(identity("db", "3.0.0"), "prod");
        repository.publish_deployment_config(&config).await.unwrap();
        let directory =
            RepositoryDeploymentDirectory::new(repository, Arc::new(ClusterIdMatcher::new("prod")));

        let mut ids: Vec<String> = directory
            .fetch_deployments()
            .await
            .unwrap()
            .iter()
            .map(|app| app.identity().to_string())
            .collect();
        ids.sort();

        assert_eq!(ids, vec!["db@3.0.0", "web@1.0.0"]);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployments.json"), "{ not json").unwrap();
        let repository = Arc::new(LocalDeploymentRepository::new(dir.path()));
        let directory =
            RepositoryDeploymentDirectory::new(repository, Arc::new(ClusterIdMatcher::new("prod")));

        assert!(directory.fetch_deployments().await.is_err());
    }

    #[tokio::test]
    async fn test_downloader_uses_install_path() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(LocalDeploymentRepository::new(dir.path().join("repo")));
        let build = dir.path().join("build");
        std::fs::create_dir_all(&build).unwrap();
        std::fs::write(build.join("app.yaml"), "exe_name: web\n").unwrap();
        let web = identity("web", "1.0.0");
        repository
            .upload_application_binaries(&web, &build, ConflictMode::FailIfExists)
            .await
            .unwrap();
        let apps = dir.path().join("apps");
        let downloader = RepositoryApplicationDownloader::new(repository, &apps);

        downloader.download_application(&web).await.unwrap();
        // A second download replaces the first
        downloader.download_application(&web).await.unwrap();

        assert!(apps.join("web/1.0.0/app.yaml").exists());
        assert_eq!(
            downloader.download_application(&identity("web", "9.9.9")).await,
            Err(DomainError::BinariesNotFound("web@9.9.9".to_string()))
        );
    }
}
