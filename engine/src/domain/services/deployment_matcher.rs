//! Deployment matchers
//! Decide whether a manifest entry applies to this instance

use crate::domain::AppDeploymentConfig;
use std::collections::BTreeMap;

pub trait DeploymentMatcher: Send + Sync {
    fn matches(&self, deployment: &AppDeploymentConfig) -> bool;
}

/// Matches deployments that target one cluster id
#[derive(Debug, Clone)]
pub struct ClusterIdMatcher {
    cluster_id: String,
}

impl ClusterIdMatcher {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }
}

impl DeploymentMatcher for ClusterIdMatcher {
    fn matches(&self, deployment: &AppDeploymentConfig) -> bool {
        deployment.targets_cluster(&self.cluster_id)
    }
}

/// Cluster id must match and every listed cluster property must equal
/// the deployment's property of the same name.
#[derive(Debug, Clone)]
pub struct ClusterPropertiesMatcher {
    cluster_id: String,
    required: BTreeMap<String, String>,
}

impl ClusterPropertiesMatcher {
    pub fn new(cluster_id: impl Into<String>, required: BTreeMap<String, String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            required,
        }
    }
}

impl DeploymentMatcher for ClusterPropertiesMatcher {
    fn matches(&self, deployment: &AppDeploymentConfig) -> bool {
        deployment.targets_cluster(&self.cluster_id)
            && self
                .required
                .iter()
                .all(|(key, value)| deployment.properties().get(key) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AppIdentity;

    fn deployment() -> AppDeploymentConfig {
        AppDeploymentConfig::new(AppIdentity::parse("web", "1.0.0").unwrap())
            .with_cluster("cluster-a")
            .with_property("region", "eu")
            .with_property("tier", "gold")
    }

    #[test]
    fn test_cluster_id_matcher() {
        assert!(ClusterIdMatcher::new("cluster-a").matches(&deployment()));
        assert!(!ClusterIdMatcher::new("cluster-b").matches(&deployment()));
    }

    #[test]
    fn test_properties_matcher_requires_cluster_and_properties() {
        let mut required = BTreeMap::new();
        required.insert("region".to_string(), "eu".to_string());

        assert!(ClusterPropertiesMatcher::new("cluster-a", required.clone()).matches(&deployment()));
        assert!(!ClusterPropertiesMatcher::new("cluster-b", required.clone()).matches(&deployment()));

        required.insert("tier".to_string(), "silver".to_string());
        assert!(!ClusterPropertiesMatcher::new("cluster-a", required).matches(&deployment()));
    }

    #[test]
    fn test_properties_matcher_without_requirements_is_cluster_match() {
        let matcher = ClusterPropertiesMatcher::new("cluster-a", BTreeMap::new());
        assert!(matcher.matches(&deployment()));
    }
}
