//! CheckForUpdates use case
//! Reconcile the applications running here with the desired deployments

use crate::domain::ports::{ApplicationDownloader, DeploymentDirectory};
use crate::domain::services::ApplicationPool;
use crate::domain::use_cases::ApplicationInstaller;
use crate::domain::{AppIdentity, AppInstallConfig};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one reconciliation cycle did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub installed: Vec<AppIdentity>,
    pub uninstalled: Vec<AppIdentity>,
    /// Application ids replaced under an update session
    pub updated: Vec<String>,
    /// Application ids whose update session was held by another update domain
    pub deferred: Vec<String>,
    /// Application ids left alone because a download failed
    pub skipped: Vec<String>,
    pub failures: Vec<String>,
}

impl UpdateReport {
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty()
            && self.uninstalled.is_empty()
            && self.updated.is_empty()
            && self.deferred.is_empty()
            && self.skipped.is_empty()
            && self.failures.is_empty()
    }
}

enum Outcome {
    Installed(AppIdentity),
    Uninstalled(AppIdentity),
    Updated(String),
    Deferred(String),
    Failed(String),
}

#[async_trait]
pub trait ApplicationUpdateManager: Send + Sync {
    /// Run one reconciliation cycle. Never fails; problems end up in the report.
    async fn check_for_updates(&self) -> UpdateReport;
}

pub struct CheckForUpdatesUseCase {
    directory: Arc<dyn DeploymentDirectory>,
    downloader: Arc<dyn ApplicationDownloader>,
    pool: Arc<ApplicationPool>,
    installer: Arc<dyn ApplicationInstaller>,
}

#[derive(Default)]
struct AppChanges {
    to_remove: Vec<AppIdentity>,
    to_deploy: Vec<AppInstallConfig>,
}

impl CheckForUpdatesUseCase {
    pub fn new(
        directory: Arc<dyn DeploymentDirectory>,
        downloader: Arc<dyn ApplicationDownloader>,
        pool: Arc<ApplicationPool>,
        installer: Arc<dyn ApplicationInstaller>,
    ) -> Self {
        Self {
            directory,
            downloader,
            pool,
            installer,
        }
    }

    /// Download everything new up front; returns the ids with a failed download
    async fn download_all(&self, to_deploy: &[&AppInstallConfig]) -> BTreeSet<String> {
        let results = join_all(to_deploy.iter().map(|config| async move {
            let identity = config.identity();
            (identity, self.downloader.download_application(identity).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(identity, result)| {
                result.err().map(|e| {
                    error!(app = %identity, error = %e, "Failed to download application");
                    identity.id().to_string()
                })
            })
            .collect()
    }

    async fn reconcile_app(&self, app_id: String, changes: AppChanges) -> Vec<Outcome> {
        if !changes.to_remove.is_empty() && !changes.to_deploy.is_empty() {
            let outcome = match self
                .installer
                .update(&changes.to_remove, &changes.to_deploy)
                .await
            {
                Ok(true) => Outcome::Updated(app_id),
                Ok(false) => Outcome::Deferred(app_id),
                Err(e) => {
                    error!(app = %app_id, error = %e, "Application update failed");
                    Outcome::Failed(format!("{}: {}", app_id, e))
                }
            };
            return vec![outcome];
        }

        let installs = join_all(changes.to_deploy.iter().map(|config| async move {
            let identity = config.identity().clone();
            match self.installer.install(config).await {
                Ok(()) => Outcome::Installed(identity),
                Err(e) => {
                    error!(app = %identity, error = %e, "Install failed");
                    Outcome::Failed(format!("{}: {}", identity, e))
                }
            }
        }));
        let uninstalls = join_all(changes.to_remove.iter().map(|identity| async move {
            match self.installer.uninstall(identity).await {
                Ok(()) => Outcome::Uninstalled(identity.clone()),
                Err(e) => {
                    error!(app = %identity, error = %e, "Uninstall failed");
                    Outcome::Failed(format!("{}: {}", identity, e))
                }
            }
        }));

        let (mut outcomes, removed) = futures::join!(installs, uninstalls);
        outcomes.extend(removed);
        outcomes
    }
}

#[async_trait]
impl ApplicationUpdateManager for CheckForUpdatesUseCase {
    async fn check_for_updates(&self) -> UpdateReport {
        let mut report = UpdateReport::default();

        let deployments = match self.directory.fetch_deployments().await {
            Ok(deployments) => deployments,
            Err(e) => {
                error!(error = %e, "Failed to fetch deployments");
                report.failures.push(format!("fetch deployments: {}", e));
                return report;
            }
        };

        let desired: HashMap<AppIdentity, AppInstallConfig> = deployments
            .iter()
            .map(|deployment| (deployment.identity().clone(), AppInstallConfig::from(deployment)))
            .collect();
        let running: BTreeSet<AppIdentity> = self.pool.list_applications().await.into_iter().collect();

        let to_remove: Vec<&AppIdentity> = running
            .iter()
            .filter(|identity| !desired.contains_key(*identity))
            .collect();
        let mut to_deploy: Vec<&AppInstallConfig> = desired
            .values()
            .filter(|config| !running.contains(config.identity()))
            .collect();
        to_deploy.sort_by(|a, b| a.identity().cmp(b.identity()));

        if to_remove.is_empty() && to_deploy.is_empty() {
            debug!(running = running.len(), "Deployments up to date");
            return report;
        }
        info!(
            to_remove = to_remove.len(),
            to_deploy = to_deploy.len(),
            "Deployment changes detected"
        );

        let failed_downloads = self.download_all(&to_deploy).await;

        let mut by_app: BTreeMap<String, AppChanges> = BTreeMap::new();
        for identity in to_remove {
            by_app
                .entry(identity.id().to_string())
                .or_default()
                .to_remove
                .push(identity.clone());
        }
        for config in to_deploy {
            by_app
                .entry(config.identity().id().to_string())
                .or_default()
                .to_deploy
                .push(config.clone());
        }
        by_app.retain(|app_id, _| {
            let keep = !failed_downloads.contains(app_id);
            if !keep {
                warn!(app = %app_id, "Skipping application this cycle, download failed");
                report.skipped.push(app_id.clone());
            }
            keep
        });

        let outcomes = join_all(
            by_app
                .into_iter()
                .map(|(app_id, changes)| self.reconcile_app(app_id, changes)),
        )
        .await;

        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Installed(identity) => report.installed.push(identity),
                Outcome::Uninstalled(identity) => report.uninstalled.push(identity),
                Outcome::Updated(app_id) => report.updated.push(app_id),
                Outcome::Deferred(app_id) => report.deferred.push(app_id),
                Outcome::Failed(failure) => report.failures.push(failure),
            }
        }

        info!(
            installed = report.installed.len(),
            uninstalled = report.uninstalled.len(),
            updated = report.updated.len(),
            deferred = report.deferred.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "Reconciliation cycle finished"
        );
        report
    }
}
