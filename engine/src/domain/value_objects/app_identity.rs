//! AppIdentity value object
//! Unique key of an application deployment: id + version

use super::AppVersion;
use crate::domain::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppIdentity {
    id: String,
    version: AppVersion,
}

impl AppIdentity {
    pub fn new(id: impl Into<String>, version: AppVersion) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }

    /// Build an identity from an id and a version string
    pub fn parse(id: impl Into<String>, version: &str) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::InvalidArgument(
                "Application id cannot be empty".to_string(),
            ));
        }
        Ok(Self::new(id, version.parse()?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &AppVersion {
        &self.version
    }
}

impl fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}
