//! AppInstallConfig value object
//! Identity plus the install-time properties carried over from the manifest

use super::{AppDeploymentConfig, AppIdentity};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInstallConfig {
    identity: AppIdentity,
    properties: BTreeMap<String, String>,
}

impl AppInstallConfig {
    pub fn new(identity: AppIdentity) -> Self {
        Self {
            identity,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_properties(identity: AppIdentity, properties: BTreeMap<String, String>) -> Self {
        Self {
            identity,
            properties,
        }
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

impl From<&AppDeploymentConfig> for AppInstallConfig {
    fn from(config: &AppDeploymentConfig) -> Self {
        Self::with_properties(config.identity().clone(), config.properties().clone())
    }
}
