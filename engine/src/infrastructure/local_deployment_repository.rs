//! Deployment repository over a shared directory
//!
//! Layout:
//! ```text
//! {root}/deployments.json
//! {root}/binaries/{id}/{version}/...
//! ```
//! Uploads are staged next to their target and renamed into place, so readers
//! never see a half-copied version.

use crate::domain::ports::DeploymentRepository;
use crate::domain::{AppIdentity, ConflictMode, DeploymentConfig, DomainError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "deployments.json";
const BINARIES_DIR: &str = "binaries";

pub struct LocalDeploymentRepository {
    root: PathBuf,
}

impl LocalDeploymentRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binaries_path(&self, identity: &AppIdentity) -> PathBuf {
        self.root
            .join(BINARIES_DIR)
            .join(identity.id())
            .join(identity.version().to_string())
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }
}

/// Storage being unreachable is worth retrying; everything else is final
pub(crate) fn storage_error(context: &str, path: &Path, e: std::io::Error) -> DomainError {
    let message = format!("{} '{}': {}", context, path.display(), e);
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            DomainError::Transient(message)
        }
        _ => DomainError::Io(message),
    }
}

async fn exists(path: &Path) -> Result<bool, DomainError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| storage_error("Failed to inspect", path, e))
}

/// Present and holding at least one entry
async fn has_content(path: &Path) -> Result<bool, DomainError> {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => Ok(entries
            .next_entry()
            .await
            .map_err(|e| storage_error("Failed to list", path, e))?
            .is_some()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(storage_error("Failed to list", path, e)),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), DomainError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage_error("Failed to remove", path, e)),
    }
}

/// Recursively copy `source` into `destination`, creating it
pub async fn copy_dir(source: &Path, destination: &Path) -> Result<u64, DomainError> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_blocking(&source, &destination))
        .await
        .map_err(|e| DomainError::Io(format!("copy task failed: {}", e)))?
}

fn copy_dir_blocking(source: &Path, destination: &Path) -> Result<u64, DomainError> {
    let mut copied = 0;
    std::fs::create_dir_all(destination)
        .map_err(|e| storage_error("Failed to create", destination, e))?;

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| DomainError::Io(format!("Failed to walk '{}': {}", source.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| DomainError::Io(e.to_string()))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| storage_error("Failed to create", &target, e))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| storage_error("Failed to copy", entry.path(), e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl DeploymentRepository for LocalDeploymentRepository {
    async fn has_application_binaries(&self, identity: &AppIdentity) -> Result<bool, DomainError> {
        exists(&self.binaries_path(identity)).await
    }

    async fn download_application_binaries(
        &self,
        identity: &AppIdentity,
        destination: &Path,
        conflict_mode: ConflictMode,
    ) -> Result<(), DomainError> {
        let source = self.binaries_path(identity);
        if !exists(&source).await? {
            return Err(DomainError::BinariesNotFound(identity.to_string()));
        }

        if has_content(destination).await? {
            match conflict_mode {
                ConflictMode::FailIfExists => {
                    return Err(DomainError::DuplicateBinaries(identity.to_string()))
                }
                ConflictMode::DoNothingIfExists => {
                    debug!(app = %identity, destination = %destination.display(), "Binaries already present, keeping them");
                    return Ok(());
                }
                ConflictMode::OverwriteExisting => remove_dir_if_exists(destination).await?,
            }
        }

        let files = copy_dir(&source, destination).await?;
        info!(
            app = %identity,
            destination = %destination.display(),
            files = files,
            "Downloaded application binaries"
        );
        Ok(())
    }

    async fn upload_application_binaries(
        &self,
        identity: &AppIdentity,
        source: &Path,
        conflict_mode: ConflictMode,
    ) -> Result<(), DomainError> {
        if !exists(source).await? {
            return Err(DomainError::InvalidArgument(format!(
                "upload source '{}' does not exist",
                source.display()
            )));
        }

        let target = self.binaries_path(identity);
        let already_published = exists(&target).await?;
        if already_published {
            match conflict_mode {
                ConflictMode::FailIfExists => {
                    return Err(DomainError::DuplicateBinaries(identity.to_string()))
                }
                ConflictMode::DoNothingIfExists => {
                    debug!(app = %identity, "Binaries already published, keeping them");
                    return Ok(());
                }
                ConflictMode::OverwriteExisting => {}
            }
        }

        let staging = target.with_file_name(format!(
            ".{}.upload-{}",
            identity.version(),
            uuid::Uuid::new_v4()
        ));
        if let Err(e) = copy_dir(source, &staging).await {
            let _ = remove_dir_if_exists(&staging).await;
            return Err(e);
        }
        if already_published {
            remove_dir_if_exists(&target).await?;
        }
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = remove_dir_if_exists(&staging).await;
            return Err(storage_error("Failed to publish", &target, e));
        }

        info!(app = %identity, "Uploaded application binaries");
        Ok(())
    }

    async fn delete_application_binaries(&self, identity: &AppIdentity) -> Result<(), DomainError> {
        let target = self.binaries_path(identity);
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {
                info!(app = %identity, "Deleted application binaries");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(DomainError::BinariesNotFound(identity.to_string()))
            }
            Err(e) => Err(storage_error("Failed to delete", &target, e)),
        }
    }

    async fn fetch_deployment_config(&self) -> Result<DeploymentConfig, DomainError> {
        let path = self.manifest_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DomainError::DeploymentConfigNotFound(
                    path.display().to_string(),
                ))
            }
            Err(e) => return Err(storage_error("Failed to read", &path, e)),
        };
        DeploymentConfig::from_json(&content)
    }

    async fn publish_deployment_config(&self, config: &DeploymentConfig) -> Result<(), DomainError> {
        let path = self.manifest_path();
        let json = config.to_json()?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| storage_error("Failed to create", &self.root, e))?;

        let staging = self
            .root
            .join(format!(".{}.{}", MANIFEST_FILE, uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| storage_error("Failed to write", &staging, e))?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove staged manifest");
            }
            return Err(storage_error("Failed to publish", &path, e));
        }
        info!(path = %path.display(), "Published deployment config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AppVersion;

    fn web(version: &str) -> AppIdentity {
        AppIdentity::parse("web", version).unwrap()
    }

    fn build_dir(dir: &Path) -> PathBuf {
        let build = dir.join("build");
        std::fs::create_dir_all(build.join("lib")).unwrap();
        std::fs::write(build.join("app.yaml"), "exe_name: web\n").unwrap();
        std::fs::write(build.join("lib/data.txt"), "payload").unwrap();
        build
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalDeploymentRepository::new(dir.path().join("repo"));
        let build = build_dir(dir.path());
        let identity = web("1.0.0");

        assert!(!repo.has_application_binaries(&identity).await.unwrap());
        repo.upload_application_binaries(&identity, &build, ConflictMode::FailIfExists)
            .await
            .unwrap();
        assert!(repo.has_application_binaries(&identity).await.unwrap());

        let install = dir.path().join("apps/web/1.0.0");
        repo.download_application_binaries(&identity, &install, ConflictMode::OverwriteExisting)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(install.join("lib/data.txt")).unwrap(),
            "payload"
        );
    }

    #[tokio::test]
    async fn test_download_missing_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalDeploymentRepository::new(dir.path());

        let result = repo
            .download_application_binaries(&web("2.0.0"), &dir.path().join("out"), ConflictMode::OverwriteExisting)
            .await;

        assert_eq!(result, Err(DomainError::BinariesNotFound("web@2.0.0".to_string())));
    }

    #[tokio::test]
    async fn test_conflict_modes_on_download() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalDeploymentRepository::new(dir.path().join("repo"));
        let build = build_dir(dir.path());
        let identity = web("1.0.0");
        repo.upload_application_binaries(&identity, &build, ConflictMode::FailIfExists)
            .await
            .unwrap();

        let install = dir.path().join("install");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join("app.yaml"), "stale").unwrap();

        let result = repo
            .download_application_binaries(&identity, &install, ConflictMode::FailIfExists)
            .await;
        assert!(matches!(result, Err(DomainError::DuplicateBinaries(_))));

        repo.download_application_binaries(&identity, &install, ConflictMode::DoNothingIfExists)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(install.join("app.yaml")).unwrap(), "stale");

        repo.download_application_binaries(&identity, &install, ConflictMode::OverwriteExisting)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(install.join("app.yaml")).unwrap(),
            "exe_name: web\n"
        );
    }

    #[tokio::test]
    async fn test_upload_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalDeploymentRepository::new(dir.path().join("repo"));
        let build = build_dir(dir.path());
        let identity = web("1.0.0");
        repo.upload_application_binaries(&identity, &build, ConflictMode::FailIfExists)
            .await
            .unwrap();

        let result = repo
            .upload_application_binaries(&identity, &build, ConflictMode::FailIfExists)
            .await;
        assert!(matches!(result, Err(DomainError::DuplicateBinaries(_))));

        std::fs::write(build.join("app.yaml"), "exe_name: web2\n").unwrap();
        repo.upload_application_binaries(&identity, &build, ConflictMode::OverwriteExisting)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(repo.binaries_path(&identity).join("app.yaml")).unwrap(),
            "exe_name: web2\n"
        );
    }

    #[tokio::test]
    async fn test_delete_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalDeploymentRepository::new(dir.path().join("repo"));
        let build = build_dir(dir.path());
        let identity = web("1.0.0");
        repo.upload_application_binaries(&identity, &build, ConflictMode::FailIfExists)
            .await
            .unwrap();

        repo.delete_application_binaries(&identity).await.unwrap();

        assert!(!repo.has_application_binaries(&identity).await.unwrap());
        assert!(matches!(
            repo.delete_application_binaries(&identity).await,
            Err(DomainError::BinariesNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manifest_publish_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalDeploymentRepository::new(dir.path());

        assert!(matches!(
            repo.fetch_deployment_config().await,
            Err(DomainError::DeploymentConfigNotFound(_))
        ));

        let config = DeploymentConfig::new()
            .add_application(AppIdentity::new("web", AppVersion::new(1, 2, 0)), "prod")
            .add_application(AppIdentity::new("api", AppVersion::new(3, 0, 0)), "prod");
        repo.publish_deployment_config(&config).await.unwrap();

        let fetched = repo.fetch_deployment_config().await.unwrap();
        assert_eq!(fetched, config);
    }
}
