//! Lease storage port
//! Time-bounded exclusive claims on named objects in shared storage

use crate::domain::DomainError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Opaque token proving ownership of a lease
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseId(String);

impl LeaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease on `name`, creating the object if needed.
    /// `LeaseAlreadyHeld` when someone else holds an unexpired lease,
    /// `Transient` when storage is unavailable.
    async fn acquire(&self, name: &str, duration: Duration) -> Result<LeaseId, DomainError>;

    /// Extend the lease by its original duration
    async fn renew(&self, name: &str, lease_id: &LeaseId) -> Result<(), DomainError>;

    async fn release(&self, name: &str, lease_id: &LeaseId) -> Result<(), DomainError>;
}

/// Port for the distributed update lock, one per application id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpdateSessionManager: Send + Sync {
    /// `Ok(false)` when another update domain is updating `app_id`
    async fn try_start_update_session(&self, app_id: &str) -> Result<bool, DomainError>;

    /// Release the session; ending a session that is not held is a no-op
    async fn end_update_session(&self, app_id: &str) -> Result<(), DomainError>;
}
