//! Lease store over a shared directory
//!
//! Each lease is a small JSON record at `{root}/{name}.lease` holding the owner's
//! lease id and a wall-clock expiry. Records are written to a private temp file
//! first; taking a free lease hard-links that file into place (fails if present),
//! so at most one of the instances sharing the directory wins. An expired record
//! is first renamed to a tombstone, which only one contender can do.

use crate::domain::ports::{LeaseId, LeaseStore};
use crate::domain::DomainError;
use crate::infrastructure::local_deployment_repository::storage_error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const LEASE_EXTENSION: &str = "lease";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    lease_id: String,
    duration_ms: u64,
    expires_at_ms: u64,
}

impl LeaseRecord {
    fn new(lease_id: &LeaseId, duration: Duration) -> Self {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self {
            lease_id: lease_id.as_str().to_string(),
            duration_ms,
            expires_at_ms: now_ms().saturating_add(duration_ms),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at_ms <= now_ms()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Renewal replaces the record with a rename after checking ownership. A
/// contender that takes the lease over in between (only possible once the
/// record has expired) is overwritten and loses on its next renew. Holders
/// renew well before expiry, so a live holder never opens that window.
pub struct FileLeaseStore {
    root: PathBuf,
}

impl FileLeaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `update-session/prod/web` -> `{root}/update-session/prod/web.lease`
    pub fn lease_path(&self, name: &str) -> Result<PathBuf, DomainError> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(DomainError::InvalidArgument(format!(
                "invalid lease name '{}'",
                name
            )));
        }
        let mut path = self.root.join(relative).into_os_string();
        path.push(".");
        path.push(LEASE_EXTENSION);
        Ok(PathBuf::from(path))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<LeaseRecord>, DomainError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error("Failed to read lease", path, e)),
        };
        match serde_json::from_slice(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A record is only ever linked into place complete; treat garbage as abandoned
                warn!(path = %path.display(), error = %e, "Unreadable lease record, treating as expired");
                Ok(Some(LeaseRecord {
                    lease_id: String::new(),
                    duration_ms: 0,
                    expires_at_ms: 0,
                }))
            }
        }
    }

    /// Write `record` to a fresh temp file next to `path`
    async fn stage(&self, path: &Path, record: &LeaseRecord) -> Result<PathBuf, DomainError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("Failed to create", parent, e))?;
        }
        let staging = path.with_extension(format!("{}.{}", LEASE_EXTENSION, uuid::Uuid::new_v4()));
        let json = serde_json::to_vec(record)?;
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| storage_error("Failed to write lease", &staging, e))?;
        Ok(staging)
    }

    async fn discard(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove temporary lease file");
            }
        }
    }

    /// Link the staged record into place unless a record already exists
    async fn try_create(&self, path: &Path, record: &LeaseRecord) -> Result<bool, DomainError> {
        let staging = self.stage(path, record).await?;
        let linked = tokio::fs::hard_link(&staging, path).await;
        Self::discard(&staging).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(storage_error("Failed to create lease", path, e)),
        }
    }

    /// Move an expired record out of the way. `false` when another contender got there first.
    async fn evict_expired(&self, path: &Path, seen: &LeaseRecord) -> Result<bool, DomainError> {
        let tombstone = path.with_extension(format!("{}.expired-{}", LEASE_EXTENSION, uuid::Uuid::new_v4()));
        match tokio::fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(storage_error("Failed to evict lease", path, e)),
        }

        // Someone may have replaced the expired record between our read and the rename
        let evicted = self.read_record(&tombstone).await?;
        if evicted.as_ref().is_some_and(|r| r.lease_id != seen.lease_id && !r.is_expired()) {
            if let Err(e) = tokio::fs::hard_link(&tombstone, path).await {
                if e.kind() != ErrorKind::AlreadyExists {
                    warn!(path = %path.display(), error = %e, "Failed to restore evicted lease");
                }
            }
            Self::discard(&tombstone).await;
            return Ok(false);
        }
        Self::discard(&tombstone).await;
        Ok(true)
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn acquire(&self, name: &str, duration: Duration) -> Result<LeaseId, DomainError> {
        let path = self.lease_path(name)?;
        let lease_id = LeaseId::generate();
        let record = LeaseRecord::new(&lease_id, duration);

        if self.try_create(&path, &record).await? {
            debug!(lease = %name, lease_id = %lease_id, "Lease acquired");
            return Ok(lease_id);
        }

        match self.read_record(&path).await? {
            Some(current) if !current.is_expired() => {
                Err(DomainError::LeaseAlreadyHeld(name.to_string()))
            }
            Some(expired) => {
                if !self.evict_expired(&path, &expired).await? {
                    return Err(DomainError::LeaseAlreadyHeld(name.to_string()));
                }
                info!(lease = %name, "Took over expired lease");
                if self.try_create(&path, &record).await? {
                    Ok(lease_id)
                } else {
                    Err(DomainError::LeaseAlreadyHeld(name.to_string()))
                }
            }
            // Released between our two reads
            None => Err(DomainError::Transient(format!(
                "lease '{}' changed during acquisition",
                name
            ))),
        }
    }

    async fn renew(&self, name: &str, lease_id: &LeaseId) -> Result<(), DomainError> {
        let path = self.lease_path(name)?;
        let current = self.read_record(&path).await?;
        let Some(current) = current.filter(|r| r.lease_id == lease_id.as_str() && !r.is_expired())
        else {
            return Err(DomainError::LeaseAlreadyHeld(name.to_string()));
        };

        let renewed = LeaseRecord::new(lease_id, Duration::from_millis(current.duration_ms));
        let staging = self.stage(&path, &renewed).await?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            Self::discard(&staging).await;
            return Err(storage_error("Failed to renew lease", &path, e));
        }
        debug!(lease = %name, lease_id = %lease_id, "Lease renewed");
        Ok(())
    }

    async fn release(&self, name: &str, lease_id: &LeaseId) -> Result<(), DomainError> {
        let path = self.lease_path(name)?;
        let held = self
            .read_record(&path)
            .await?
            .is_some_and(|current| current.lease_id == lease_id.as_str());
        if !held {
            debug!(lease = %name, lease_id = %lease_id, "Lease not held, nothing to release");
            return Ok(());
        }

        let tombstone = path.with_extension(format!("{}.released-{}", LEASE_EXTENSION, uuid::Uuid::new_v4()));
        match tokio::fs::rename(&path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(storage_error("Failed to release lease", &path, e)),
        }

        // A contender may have taken the lease over since our read; put theirs back
        let removed = self.read_record(&tombstone).await?;
        if removed.as_ref().is_some_and(|r| r.lease_id != lease_id.as_str()) {
            if let Err(e) = tokio::fs::hard_link(&tombstone, &path).await {
                if e.kind() != ErrorKind::AlreadyExists {
                    warn!(path = %path.display(), error = %e, "Failed to restore lease taken over during release");
                }
            }
            Self::discard(&tombstone).await;
            debug!(lease = %name, lease_id = %lease_id, "Lease taken over before release");
            return Ok(());
        }
        Self::discard(&tombstone).await;
        debug!(lease = %name, lease_id = %lease_id, "Lease released");
        Ok(())
    }
}
