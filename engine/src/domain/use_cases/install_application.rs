//! Application installer use case
//! Install, uninstall, and update-as-a-unit under the update session lock

use crate::domain::ports::{ApplicationFactory, UpdateSessionManager};
use crate::domain::services::ApplicationPool;
use crate::domain::{AppIdentity, AppInstallConfig, DomainError};
use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Install location of `identity` below `applications_root`
pub fn install_path(applications_root: &Path, identity: &AppIdentity) -> PathBuf {
    applications_root
        .join(identity.id())
        .join(identity.version().to_string())
}

#[async_trait]
pub trait ApplicationInstaller: Send + Sync {
    async fn install(&self, config: &AppInstallConfig) -> Result<(), DomainError>;

    async fn uninstall(&self, identity: &AppIdentity) -> Result<(), DomainError>;

    /// Replace `to_remove` with `to_deploy` while holding the update session
    /// of their application id. `Ok(false)` when another update domain holds it.
    async fn update(
        &self,
        to_remove: &[AppIdentity],
        to_deploy: &[AppInstallConfig],
    ) -> Result<bool, DomainError>;
}

pub struct InstallApplicationUseCase {
    applications_root: PathBuf,
    pool: Arc<ApplicationPool>,
    factory: Arc<dyn ApplicationFactory>,
    sessions: Arc<dyn UpdateSessionManager>,
}

impl InstallApplicationUseCase {
    pub fn new(
        applications_root: impl Into<PathBuf>,
        pool: Arc<ApplicationPool>,
        factory: Arc<dyn ApplicationFactory>,
        sessions: Arc<dyn UpdateSessionManager>,
    ) -> Self {
        Self {
            applications_root: applications_root.into(),
            pool,
            factory,
            sessions,
        }
    }

    fn validate_update(
        to_remove: &[AppIdentity],
        to_deploy: &[AppInstallConfig],
    ) -> Result<String, DomainError> {
        let (Some(first), false) = (to_remove.first(), to_deploy.is_empty()) else {
            return Err(DomainError::InvalidArgument(
                "update needs versions to remove and versions to deploy".to_string(),
            ));
        };

        let app_id = first.id();
        let same_id = to_remove.iter().all(|identity| identity.id() == app_id)
            && to_deploy.iter().all(|config| config.identity().id() == app_id);
        if !same_id {
            return Err(DomainError::InvalidArgument(format!(
                "all versions of an update must belong to '{}'",
                app_id
            )));
        }
        Ok(app_id.to_string())
    }

    /// Uninstalls strictly precede installs; a failed uninstall skips the installs
    async fn apply_update(
        &self,
        to_remove: &[AppIdentity],
        to_deploy: &[AppInstallConfig],
    ) -> Result<(), DomainError> {
        let failures = collect_failures(
            join_all(to_remove.iter().map(|identity| self.uninstall(identity))).await,
        );
        if !failures.is_empty() {
            return Err(DomainError::Aggregate(failures));
        }

        let failures =
            collect_failures(join_all(to_deploy.iter().map(|config| self.install(config))).await);
        if !failures.is_empty() {
            return Err(DomainError::Aggregate(failures));
        }
        Ok(())
    }
}

fn collect_failures(results: Vec<Result<(), DomainError>>) -> Vec<String> {
    results
        .into_iter()
        .filter_map(|result| result.err().map(|e| e.to_string()))
        .collect()
}

#[async_trait]
impl ApplicationInstaller for InstallApplicationUseCase {
    async fn install(&self, config: &AppInstallConfig) -> Result<(), DomainError> {
        let identity = config.identity();
        if self.pool.has_application(identity).await {
            return Err(DomainError::DuplicateApplication(identity.to_string()));
        }

        let path = install_path(&self.applications_root, identity);
        debug!(app = %identity, path = %path.display(), "Installing application");
        let application = self.factory.create_application(config, &path).await?;
        self.pool.add_application(application).await?;

        info!(app = %identity, "Application installed");
        Ok(())
    }

    async fn uninstall(&self, identity: &AppIdentity) -> Result<(), DomainError> {
        let removed = self.pool.remove_application(identity).await;

        let path = install_path(&self.applications_root, identity);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(app = %identity, path = %path.display(), "Install directory deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(app = %identity, error = %e, "Failed to delete install directory");
                return Err(e.into());
            }
        }

        removed?;
        info!(app = %identity, "Application uninstalled");
        Ok(())
    }

    async fn update(
        &self,
        to_remove: &[AppIdentity],
        to_deploy: &[AppInstallConfig],
    ) -> Result<bool, DomainError> {
        let app_id = Self::validate_update(to_remove, to_deploy)?;

        if !self.sessions.try_start_update_session(&app_id).await? {
            info!(app = %app_id, "Update deferred, another update domain holds the session");
            return Ok(false);
        }

        info!(
            app = %app_id,
            removing = to_remove.len(),
            deploying = to_deploy.len(),
            "Updating application"
        );
        let applied = self.apply_update(to_remove, to_deploy).await;
        if let Err(e) = &applied {
            error!(app = %app_id, error = %e, "Update failed");
        }

        if let Err(e) = self.sessions.end_update_session(&app_id).await {
            warn!(app = %app_id, error = %e, "Failed to end update session");
            applied?;
            return Err(e);
        }

        applied.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Application, MockUpdateSessionManager};
    use crate::domain::services::application_pool::tests::FakeApplication;
    use crate::domain::services::InMemoryUpdateSessionManager;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFactory {
        failing: HashSet<AppIdentity>,
        /// Created applications whose stop fails
        stuck: HashSet<AppIdentity>,
        created: Mutex<Vec<AppIdentity>>,
    }

    impl FakeFactory {
        fn created(&self) -> Vec<AppIdentity> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApplicationFactory for FakeFactory {
        async fn create_application(
            &self,
            config: &AppInstallConfig,
            _install_path: &Path,
        ) -> Result<Arc<dyn Application>, DomainError> {
            let identity = config.identity();
            self.created.lock().unwrap().push(identity.clone());
            if self.failing.contains(identity) {
                return Err(DomainError::ProcessFailed(format!("cannot create {}", identity)));
            }
            let mut application = FakeApplication::new(identity.id(), &identity.version().to_string());
            application.fail_stop = self.stuck.contains(identity);
            Ok(Arc::new(application))
        }
    }

    fn identity(id: &str, version: &str) -> AppIdentity {
        AppIdentity::parse(id, version).unwrap()
    }

    fn config(id: &str, version: &str) -> AppInstallConfig {
        AppInstallConfig::new(identity(id, version))
    }

    fn installer(
        root: &Path,
        factory: impl Into<Arc<FakeFactory>>,
        sessions: Arc<dyn UpdateSessionManager>,
    ) -> (InstallApplicationUseCase, Arc<ApplicationPool>) {
        let pool = Arc::new(ApplicationPool::new());
        let factory: Arc<FakeFactory> = factory.into();
        let installer = InstallApplicationUseCase::new(root, pool.clone(), factory, sessions);
        (installer, pool)
    }

    #[test]
    fn test_install_path_layout() {
        assert_eq!(
            install_path(Path::new("/srv/apps"), &identity("web", "1.2.3")),
            PathBuf::from("/srv/apps/web/1.2.3")
        );
    }

    #[tokio::test]
    async fn test_install_then_uninstall_removes_app_and_directory() {
        let root = tempfile::tempdir().unwrap();
        let (installer, pool) = installer(
            root.path(),
            FakeFactory::default(),
            Arc::new(InMemoryUpdateSessionManager::new()),
        );
        let web = identity("web", "1.0.0");
        let dir = install_path(root.path(), &web);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("web"), "binary").unwrap();

        installer.install(&config("web", "1.0.0")).await.unwrap();
        assert!(pool.has_application(&web).await);

        installer.uninstall(&web).await.unwrap();
        assert!(!pool.has_application(&web).await);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_uninstall_missing_directory_is_fine() {
        let root = tempfile::tempdir().unwrap();
        let (installer, _pool) = installer(
            root.path(),
            FakeFactory::default(),
            Arc::new(InMemoryUpdateSessionManager::new()),
        );

        installer.uninstall(&identity("ghost", "1.0.0")).await.unwrap();
    }

    #[tokio::test]
    async fn test_install_twice_fails_and_keeps_first() {
        let root = tempfile::tempdir().unwrap();
        let (installer, pool) = installer(
            root.path(),
            FakeFactory::default(),
            Arc::new(InMemoryUpdateSessionManager::new()),
        );
        installer.install(&config("web", "1.0.0")).await.unwrap();
        let first = pool.get_application(&identity("web", "1.0.0")).await.unwrap();

        let result = installer.install(&config("web", "1.0.0")).await;

        assert!(matches!(result, Err(DomainError::DuplicateApplication(_))));
        let current = pool.get_application(&identity("web", "1.0.0")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_replaces_versions() {
        let root = tempfile::tempdir().unwrap();
        let sessions = Arc::new(InMemoryUpdateSessionManager::new());
        let (installer, pool) = installer(root.path(), FakeFactory::default(), sessions.clone());
        installer.install(&config("web", "1.0.0")).await.unwrap();

        let updated = installer
            .update(&[identity("web", "1.0.0")], &[config("web", "1.1.0")])
            .await
            .unwrap();

        assert!(updated);
        assert!(!pool.has_application(&identity("web", "1.0.0")).await);
        assert!(pool.has_application(&identity("web", "1.1.0")).await);
        assert!(!sessions.is_active("web"));
    }

    #[tokio::test]
    async fn test_update_under_contention_leaves_pool_untouched() {
        let root = tempfile::tempdir().unwrap();
        let mut sessions = MockUpdateSessionManager::new();
        sessions
            .expect_try_start_update_session()
            .times(1)
            .returning(|_| Ok(false));
        sessions.expect_end_update_session().never();
        let (installer, pool) = installer(root.path(), FakeFactory::default(), Arc::new(sessions));
        installer.install(&config("web", "1.0.0")).await.unwrap();

        let updated = installer
            .update(&[identity("web", "1.0.0")], &[config("web", "1.1.0")])
            .await
            .unwrap();

        assert!(!updated);
        assert!(pool.has_application(&identity("web", "1.0.0")).await);
        assert!(!pool.has_application(&identity("web", "1.1.0")).await);
    }

    #[tokio::test]
    async fn test_update_ends_session_once_when_install_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut sessions = MockUpdateSessionManager::new();
        sessions
            .expect_try_start_update_session()
            .times(1)
            .returning(|_| Ok(true));
        sessions
            .expect_end_update_session()
            .withf(|app_id| app_id.to_string() == "web")
            .times(1)
            .returning(|_| Ok(()));
        let factory = FakeFactory {
            failing: HashSet::from([identity("web", "2.0.0")]),
            ..Default::default()
        };
        let (installer, pool) = installer(root.path(), factory, Arc::new(sessions));
        installer.install(&config("web", "1.0.0")).await.unwrap();

        let result = installer
            .update(&[identity("web", "1.0.0")], &[config("web", "2.0.0")])
            .await;

        assert!(matches!(result, Err(DomainError::Aggregate(_))));
        assert!(!pool.has_application(&identity("web", "1.0.0")).await);
    }

    #[tokio::test]
    async fn test_update_ends_session_once_when_uninstall_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut sessions = MockUpdateSessionManager::new();
        sessions
            .expect_try_start_update_session()
            .times(1)
            .returning(|_| Ok(true));
        sessions
            .expect_end_update_session()
            .withf(|app_id| app_id.to_string() == "web")
            .times(1)
            .returning(|_| Ok(()));
        let factory = Arc::new(FakeFactory {
            stuck: HashSet::from([identity("web", "1.0.0")]),
            ..Default::default()
        });
        let (installer, pool) = installer(root.path(), factory.clone(), Arc::new(sessions));
        installer.install(&config("web", "1.0.0")).await.unwrap();

        let result = installer
            .update(&[identity("web", "1.0.0")], &[config("web", "2.0.0")])
            .await;

        assert!(matches!(result, Err(DomainError::Aggregate(_))));
        assert_eq!(factory.created(), vec![identity("web", "1.0.0")]);
        assert!(!pool.has_application(&identity("web", "2.0.0")).await);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_arguments() {
        let root = tempfile::tempdir().unwrap();
        let mut sessions = MockUpdateSessionManager::new();
        sessions.expect_try_start_update_session().never();
        let (installer, _pool) = installer(root.path(), FakeFactory::default(), Arc::new(sessions));

        let empty_remove = installer.update(&[], &[config("web", "1.0.0")]).await;
        let empty_deploy = installer.update(&[identity("web", "1.0.0")], &[]).await;
        let mixed = installer
            .update(&[identity("web", "1.0.0")], &[config("api", "1.0.0")])
            .await;

        assert!(matches!(empty_remove, Err(DomainError::InvalidArgument(_))));
        assert!(matches!(empty_deploy, Err(DomainError::InvalidArgument(_))));
        assert!(matches!(mixed, Err(DomainError::InvalidArgument(_))));
    }
}
