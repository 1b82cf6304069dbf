//! Deployment manifest value objects
//! `AppDeploymentConfig` is one application entry, `DeploymentConfig` is the whole manifest.
//!
//! The manifest is edited immutably: every mutator returns a new config, so a
//! publisher can build the next manifest from the current one and upload it.

use super::{AppIdentity, AppVersion};
use crate::domain::DomainError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDeploymentConfig {
    identity: AppIdentity,
    target_clusters: BTreeSet<String>,
    properties: BTreeMap<String, String>,
}

impl AppDeploymentConfig {
    pub fn new(identity: AppIdentity) -> Self {
        Self {
            identity,
            target_clusters: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.target_clusters.insert(cluster_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    pub fn target_clusters(&self) -> &BTreeSet<String> {
        &self.target_clusters
    }

    pub fn targets_cluster(&self, cluster_id: &str) -> bool {
        self.target_clusters.contains(cluster_id)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// Wire format of one manifest entry
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AppDeploymentEntry {
    id: String,
    version: AppVersion,
    #[serde(default)]
    target_clusters: BTreeSet<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeploymentDocument {
    #[serde(default)]
    applications: Vec<AppDeploymentEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentConfig {
    apps: BTreeMap<AppIdentity, AppDeploymentConfig>,
}

impl DeploymentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_apps(apps: impl IntoIterator<Item = AppDeploymentConfig>) -> Self {
        Self {
            apps: apps
                .into_iter()
                .map(|app| (app.identity().clone(), app))
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, DomainError> {
        let document: DeploymentDocument = serde_json::from_str(json)?;
        let mut config = DeploymentConfig::new();
        for entry in document.applications {
            if entry.id.trim().is_empty() {
                return Err(DomainError::InvalidConfiguration(
                    "Manifest entry with an empty application id".to_string(),
                ));
            }
            let identity = AppIdentity::new(entry.id, entry.version);
            if config.apps.contains_key(&identity) {
                return Err(DomainError::InvalidConfiguration(format!(
                    "Application '{}' is listed more than once",
                    identity
                )));
            }
            config.apps.insert(
                identity.clone(),
                AppDeploymentConfig {
                    identity,
                    target_clusters: entry.target_clusters,
                    properties: entry.properties,
                },
            );
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, DomainError> {
        let document = DeploymentDocument {
            applications: self
                .apps
                .values()
                .map(|app| AppDeploymentEntry {
                    id: app.identity.id().to_string(),
                    version: app.identity.version().clone(),
                    target_clusters: app.target_clusters.clone(),
                    properties: app.properties.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    // ===== Queries =====

    pub fn apps(&self) -> impl Iterator<Item = &AppDeploymentConfig> {
        self.apps.values()
    }

    pub fn get(&self, identity: &AppIdentity) -> Option<&AppDeploymentConfig> {
        self.apps.get(identity)
    }

    pub fn has_application(&self, app_id: &str) -> bool {
        self.apps.keys().any(|identity| identity.id() == app_id)
    }

    pub fn has_application_version(&self, identity: &AppIdentity) -> bool {
        self.apps.contains_key(identity)
    }

    /// Distinct application ids, sorted
    pub fn list_applications(&self) -> Vec<String> {
        let ids: BTreeSet<&str> = self.apps.keys().map(|identity| identity.id()).collect();
        ids.into_iter().map(str::to_string).collect()
    }

    /// Versions of one application, lowest first
    pub fn list_versions(&self, app_id: &str) -> Vec<AppVersion> {
        self.apps
            .keys()
            .filter(|identity| identity.id() == app_id)
            .map(|identity| identity.version().clone())
            .collect()
    }

    pub fn list_clusters(&self, identity: &AppIdentity) -> Vec<String> {
        self.apps
            .get(identity)
            .map(|app| app.target_clusters.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ===== Immutable edits =====

    /// Target `cluster_id` with `identity`, creating the entry if needed
    pub fn add_application(&self, identity: AppIdentity, cluster_id: &str) -> Self {
        let mut next = self.clone();
        next.apps
            .entry(identity.clone())
            .or_insert_with(|| AppDeploymentConfig::new(identity))
            .target_clusters
            .insert(cluster_id.to_string());
        next
    }

    /// Remove every version of an application
    pub fn remove_application(&self, app_id: &str) -> Result<Self, DomainError> {
        if !self.has_application(app_id) {
            return Err(DomainError::ApplicationNotFound(app_id.to_string()));
        }
        let mut next = self.clone();
        next.apps.retain(|identity, _| identity.id() != app_id);
        Ok(next)
    }

    pub fn remove_application_version(&self, identity: &AppIdentity) -> Result<Self, DomainError> {
        let mut next = self.clone();
        next.apps
            .remove(identity)
            .ok_or_else(|| DomainError::ApplicationNotFound(identity.to_string()))?;
        Ok(next)
    }

    /// Stop targeting a cluster; the entry is dropped once no cluster is left
    pub fn remove_cluster(
        &self,
        identity: &AppIdentity,
        cluster_id: &str,
    ) -> Result<Self, DomainError> {
        let mut next = self.clone();
        let app = next
            .apps
            .get_mut(identity)
            .ok_or_else(|| DomainError::ApplicationNotFound(identity.to_string()))?;
        if !app.target_clusters.remove(cluster_id) {
            return Err(DomainError::DeploymentConfigNotFound(format!(
                "{} does not target cluster '{}'",
                identity, cluster_id
            )));
        }
        if app.target_clusters.is_empty() {
            next.apps.remove(identity);
        }
        Ok(next)
    }

    pub fn set_properties(
        &self,
        identity: &AppIdentity,
        properties: BTreeMap<String, String>,
    ) -> Result<Self, DomainError> {
        let mut next = self.clone();
        let app = next
            .apps
            .get_mut(identity)
            .ok_or_else(|| DomainError::ApplicationNotFound(identity.to_string()))?;
        app.properties = properties;
        Ok(next)
    }
}
