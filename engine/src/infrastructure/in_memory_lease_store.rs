//! In-process lease store for single-host setups and tests

use crate::domain::ports::{LeaseId, LeaseStore};
use crate::domain::DomainError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Lease {
    id: LeaseId,
    duration: Duration,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, Lease>> {
        match self.leases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether `name` carries an unexpired lease
    pub fn is_leased(&self, name: &str) -> bool {
        self.leases()
            .get(name)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, name: &str, duration: Duration) -> Result<LeaseId, DomainError> {
        let now = Instant::now();
        let mut leases = self.leases();
        if leases.get(name).is_some_and(|lease| lease.expires_at > now) {
            return Err(DomainError::LeaseAlreadyHeld(name.to_string()));
        }

        let id = LeaseId::generate();
        leases.insert(
            name.to_string(),
            Lease {
                id: id.clone(),
                duration,
                expires_at: now + duration,
            },
        );
        debug!(lease = %name, lease_id = %id, "Lease acquired");
        Ok(id)
    }

    async fn renew(&self, name: &str, lease_id: &LeaseId) -> Result<(), DomainError> {
        let now = Instant::now();
        let mut leases = self.leases();
        match leases.get_mut(name) {
            Some(lease) if lease.id == *lease_id && lease.expires_at > now => {
                lease.expires_at = now + lease.duration;
                Ok(())
            }
            _ => Err(DomainError::LeaseAlreadyHeld(name.to_string())),
        }
    }

    async fn release(&self, name: &str, lease_id: &LeaseId) -> Result<(), DomainError> {
        let mut leases = self.leases();
        if leases.get(name).is_some_and(|lease| lease.id == *lease_id) {
            leases.remove(name);
            debug!(lease = %name, lease_id = %lease_id, "Lease released");
        } else {
            debug!(lease = %name, lease_id = %lease_id, "Lease not held, nothing to release");
        }
        Ok(())
    }
}
