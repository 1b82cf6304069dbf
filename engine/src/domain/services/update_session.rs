//! Update session managers
//! Serialize updates of one application across update domains

use crate::domain::constants::{
    LEASE_RENEWAL_MARGIN_SEC, MAX_LEASE_DURATION_SEC, MIN_LEASE_DURATION_SEC,
};
use crate::domain::ports::{LeaseId, LeaseStore, UpdateSessionManager};
use crate::domain::{DomainError, RetryPolicy};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the lock object guarding updates of `app_id` in `cluster_id`
pub fn update_lock_name(cluster_id: &str, app_id: &str) -> String {
    format!("update-session/{}/{}", cluster_id, app_id)
}

/// Lease settings shared by every session of a manager
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub duration: Duration,
    pub operation_timeout: Duration,
    pub retry: RetryPolicy,
}

impl LeaseSettings {
    pub fn validate(&self) -> Result<(), DomainError> {
        let secs = self.duration.as_secs();
        if !(MIN_LEASE_DURATION_SEC..=MAX_LEASE_DURATION_SEC).contains(&secs) {
            return Err(DomainError::InvalidConfiguration(format!(
                "lease duration must be between {} and {} seconds, got {}",
                MIN_LEASE_DURATION_SEC, MAX_LEASE_DURATION_SEC, secs
            )));
        }
        if self.operation_timeout.is_zero() {
            return Err(DomainError::InvalidConfiguration(
                "lease operation timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Renew early enough that a slow renew still lands before expiry
    pub fn renewal_interval(&self) -> Duration {
        self.duration
            .saturating_sub(Duration::from_secs(LEASE_RENEWAL_MARGIN_SEC))
            .max(Duration::from_secs(1))
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: &str,
    future: impl Future<Output = Result<T, DomainError>>,
) -> Result<T, DomainError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| DomainError::Timeout(format!("{} after {:?}", operation, timeout)))?
}

struct HeldSession {
    lease_name: String,
    lease_id: LeaseId,
    renewal: CancellationToken,
    renewal_task: JoinHandle<()>,
}

/// Update sessions backed by leases in shared storage.
///
/// A held lease is renewed in the background until the session ends.
pub struct LeaseUpdateSessionManager {
    lease_store: Arc<dyn LeaseStore>,
    cluster_id: String,
    update_domain: String,
    settings: LeaseSettings,
    sessions: Mutex<HashMap<String, HeldSession>>,
}

impl LeaseUpdateSessionManager {
    pub fn new(
        lease_store: Arc<dyn LeaseStore>,
        cluster_id: impl Into<String>,
        update_domain: impl Into<String>,
        settings: LeaseSettings,
    ) -> Result<Self, DomainError> {
        settings.validate()?;
        Ok(Self {
            lease_store,
            cluster_id: cluster_id.into(),
            update_domain: update_domain.into(),
            settings,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn acquire(&self, lease_name: &str) -> Result<LeaseId, DomainError> {
        let settings = &self.settings;
        settings
            .retry
            .execute_transient("acquire update lease", || {
                let store = self.lease_store.clone();
                async move {
                    with_timeout(
                        settings.operation_timeout,
                        "acquire update lease",
                        store.acquire(lease_name, settings.duration),
                    )
                    .await
                }
            })
            .await
    }

    async fn release(&self, lease_name: &str, lease_id: &LeaseId) -> Result<(), DomainError> {
        let settings = &self.settings;
        settings
            .retry
            .execute_transient("release update lease", || {
                let store = self.lease_store.clone();
                async move {
                    with_timeout(
                        settings.operation_timeout,
                        "release update lease",
                        store.release(lease_name, lease_id),
                    )
                    .await
                }
            })
            .await
    }

    fn spawn_renewal(&self, lease_name: String, lease_id: LeaseId, token: CancellationToken) -> JoinHandle<()> {
        let store = self.lease_store.clone();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let interval = settings.renewal_interval();
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let renewed = settings
                    .retry
                    .execute_transient("renew update lease", || {
                        let store = store.clone();
                        let (name, id) = (lease_name.clone(), lease_id.clone());
                        let timeout = settings.operation_timeout;
                        async move {
                            with_timeout(timeout, "renew update lease", store.renew(&name, &id)).await
                        }
                    })
                    .await;

                match renewed {
                    Ok(()) => debug!(lease = %lease_name, "Update lease renewed"),
                    Err(DomainError::LeaseAlreadyHeld(_)) => {
                        error!(lease = %lease_name, "Update lease lost to another owner");
                        return;
                    }
                    Err(e) => warn!(lease = %lease_name, error = %e, "Failed to renew update lease"),
                }
            }
        })
    }
}

#[async_trait]
impl UpdateSessionManager for LeaseUpdateSessionManager {
    async fn try_start_update_session(&self, app_id: &str) -> Result<bool, DomainError> {
        if self.sessions.lock().await.contains_key(app_id) {
            debug!(app = %app_id, "Update session already in progress");
            return Ok(false);
        }

        let lease_name = update_lock_name(&self.cluster_id, app_id);
        let lease_id = match self.acquire(&lease_name).await {
            Ok(lease_id) => lease_id,
            Err(DomainError::LeaseAlreadyHeld(_)) => {
                info!(
                    app = %app_id,
                    update_domain = %self.update_domain,
                    "Another update domain is updating this application"
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(app_id) {
            drop(sessions);
            self.release(&lease_name, &lease_id).await?;
            return Ok(false);
        }

        let renewal = CancellationToken::new();
        let renewal_task = self.spawn_renewal(lease_name.clone(), lease_id.clone(), renewal.clone());
        info!(
            app = %app_id,
            update_domain = %self.update_domain,
            lease = %lease_name,
            "Update session started"
        );
        sessions.insert(
            app_id.to_string(),
            HeldSession {
                lease_name,
                lease_id,
                renewal,
                renewal_task,
            },
        );
        Ok(true)
    }

    async fn end_update_session(&self, app_id: &str) -> Result<(), DomainError> {
        let Some(session) = self.sessions.lock().await.remove(app_id) else {
            return Ok(());
        };

        session.renewal.cancel();
        let _ = session.renewal_task.await;

        self.release(&session.lease_name, &session.lease_id).await?;
        info!(app = %app_id, update_domain = %self.update_domain, "Update session ended");
        Ok(())
    }
}

/// Process-local sessions for single-instance deployments and tests
#[derive(Default)]
pub struct InMemoryUpdateSessionManager {
    active: std::sync::Mutex<HashSet<String>>,
}

impl InMemoryUpdateSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, app_id: &str) -> bool {
        match self.active.lock() {
            Ok(active) => active.contains(app_id),
            Err(poisoned) => poisoned.into_inner().contains(app_id),
        }
    }
}

#[async_trait]
impl UpdateSessionManager for InMemoryUpdateSessionManager {
    async fn try_start_update_session(&self, app_id: &str) -> Result<bool, DomainError> {
        let mut active = self.active.lock().map_err(|_| {
            DomainError::InvalidArgument("update session registry poisoned".to_string())
        })?;
        Ok(active.insert(app_id.to_string()))
    }

    async fn end_update_session(&self, app_id: &str) -> Result<(), DomainError> {
        let mut active = self.active.lock().map_err(|_| {
            DomainError::InvalidArgument("update session registry poisoned".to_string())
        })?;
        active.remove(app_id);
        Ok(())
    }
}
