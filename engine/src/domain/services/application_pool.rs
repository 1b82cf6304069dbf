//! Application Pool
//! Registry of the applications running on this instance

use crate::domain::ports::{Application, ApplicationExitEvent};
use crate::domain::{AppIdentity, DomainError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

const POOL_EVENT_CAPACITY: usize = 64;

/// Holds at most one application per identity.
///
/// An identity is reserved before the application starts so concurrent adds
/// of the same identity cannot both start it.
pub struct ApplicationPool {
    applications: RwLock<HashMap<AppIdentity, Arc<dyn Application>>>,
    exit_tx: broadcast::Sender<ApplicationExitEvent>,
}

impl Default for ApplicationPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationPool {
    pub fn new() -> Self {
        let (exit_tx, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        Self {
            applications: RwLock::new(HashMap::new()),
            exit_tx,
        }
    }

    /// Register and start `application`.
    ///
    /// Fails with `DuplicateApplication` if the identity is already present.
    /// If the start fails the identity is released again.
    pub async fn add_application(&self, application: Arc<dyn Application>) -> Result<(), DomainError> {
        let identity = application.identity().clone();
        {
            let mut applications = self.applications.write().await;
            if applications.contains_key(&identity) {
                return Err(DomainError::DuplicateApplication(identity.to_string()));
            }
            applications.insert(identity.clone(), application.clone());
        }

        let exited = application.subscribe_exited();
        if let Err(e) = application.start().await {
            error!(app = %identity, error = %e, "Failed to start application");
            self.applications.write().await.remove(&identity);
            return Err(e);
        }

        self.forward_exits(exited);
        info!(app = %identity, "Application added to pool");
        Ok(())
    }

    /// Stop and unregister the application. Absent identities are a no-op.
    pub async fn remove_application(&self, identity: &AppIdentity) -> Result<(), DomainError> {
        let application = self.applications.read().await.get(identity).cloned();
        let Some(application) = application else {
            debug!(app = %identity, "Application not in pool, nothing to remove");
            return Ok(());
        };

        let stopped = application.stop().await;
        self.applications.write().await.remove(identity);

        match stopped {
            Ok(()) => {
                info!(app = %identity, "Application removed from pool");
                Ok(())
            }
            Err(e) => {
                warn!(app = %identity, error = %e, "Application removed but stop failed");
                Err(e)
            }
        }
    }

    pub async fn has_application(&self, identity: &AppIdentity) -> bool {
        self.applications.read().await.contains_key(identity)
    }

    pub async fn get_application(&self, identity: &AppIdentity) -> Option<Arc<dyn Application>> {
        self.applications.read().await.get(identity).cloned()
    }

    pub async fn list_applications(&self) -> Vec<AppIdentity> {
        let mut identities: Vec<_> = self.applications.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub async fn len(&self) -> usize {
        self.applications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.applications.read().await.is_empty()
    }

    /// Unexpected exits of any pooled application
    pub fn subscribe_exited(&self) -> broadcast::Receiver<ApplicationExitEvent> {
        self.exit_tx.subscribe()
    }

    /// Stop every application; failures are collected into one `Aggregate` error
    pub async fn shutdown(&self) -> Result<(), DomainError> {
        let applications: Vec<_> = self.applications.write().await.drain().collect();
        info!(count = applications.len(), "Shutting down application pool");

        let results = futures::future::join_all(applications.into_iter().map(
            |(identity, application)| async move { (identity, application.stop().await) },
        ))
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(identity, result)| {
                result.err().map(|e| {
                    error!(app = %identity, error = %e, "Failed to stop application");
                    format!("{}: {}", identity, e)
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Aggregate(failures))
        }
    }

    fn forward_exits(&self, mut exited: broadcast::Receiver<ApplicationExitEvent>) {
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            loop {
                match exited.recv().await {
                    Ok(event) => {
                        warn!(
                            app = %event.identity,
                            reason = %event.reason,
                            "Application exited unexpectedly"
                        );
                        let _ = exit_tx.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}
