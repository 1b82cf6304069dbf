//! Configuration loading from YAML files
//!
//! Two documents:
//! - the agent configuration (`deployer.yaml`), overlaid with `DEPLOYER_*` environment variables
//! - the per-application runtime configuration (`app.yaml`) shipped with each application's binaries

use crate::domain::constants::{
    DEFAULT_CHECK_INTERVAL_SEC, DEFAULT_HEALTH_CHECK_INTERVAL_SEC,
    DEFAULT_INITIALIZATION_TIMEOUT_SEC, DEFAULT_LEASE_DURATION_SEC,
    DEFAULT_LEASE_OPERATION_TIMEOUT_SEC, DEFAULT_MAX_RESTART_ATTEMPTS, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_STOP_GRACE_SEC, MAX_LEASE_DURATION_SEC,
    MIN_LEASE_DURATION_SEC,
};
use crate::domain::services::LeaseSettings;
use crate::domain::{Backoff, DomainError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_CONFIG_FILE: &str = "app.yaml";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/deployer/deployer.yaml";

const ENV_PREFIX: &str = "DEPLOYER_";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub cluster_id: String,
    pub instance_id: String,
    pub update_domain: String,

    /// Properties of this cluster that deployments may require
    pub cluster_properties: BTreeMap<String, String>,

    /// Shared directory holding the manifest, binaries and lease objects
    pub repository_root: PathBuf,

    pub applications_root: PathBuf,

    /// Where the handshake sockets are created
    pub ipc_dir: PathBuf,

    pub check_interval_sec: u64,
    pub lease_duration_sec: u64,
    pub lease_operation_timeout_sec: u64,

    pub retry_max_attempts: u32,
    /// "fixed" or "exponential"
    pub retry_backoff: String,
    pub retry_delay_ms: u64,

    pub stop_grace_sec: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            instance_id: default_instance_id(),
            update_domain: "0".to_string(),
            cluster_properties: BTreeMap::new(),
            repository_root: PathBuf::from("/var/lib/deployer/repository"),
            applications_root: PathBuf::from("/var/lib/deployer/apps"),
            ipc_dir: PathBuf::from("/run/deployer"),
            check_interval_sec: DEFAULT_CHECK_INTERVAL_SEC,
            lease_duration_sec: DEFAULT_LEASE_DURATION_SEC,
            lease_operation_timeout_sec: DEFAULT_LEASE_OPERATION_TIMEOUT_SEC,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_backoff: "exponential".to_string(),
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            stop_grace_sec: DEFAULT_STOP_GRACE_SEC,
        }
    }
}

fn default_instance_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl AgentConfig {
    /// Overlay `DEPLOYER_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), DomainError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values looked up by variable name, e.g. `DEPLOYER_CLUSTER_ID`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), DomainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(v) = var("CLUSTER_ID") {
            self.cluster_id = v;
        }
        if let Some(v) = var("INSTANCE_ID") {
            self.instance_id = v;
        }
        if let Some(v) = var("UPDATE_DOMAIN") {
            self.update_domain = v;
        }
        if let Some(v) = var("REPOSITORY_ROOT") {
            self.repository_root = PathBuf::from(v);
        }
        if let Some(v) = var("APPLICATIONS_ROOT") {
            self.applications_root = PathBuf::from(v);
        }
        if let Some(v) = var("IPC_DIR") {
            self.ipc_dir = PathBuf::from(v);
        }
        if let Some(v) = var("CHECK_INTERVAL_SEC") {
            self.check_interval_sec = parse_number("CHECK_INTERVAL_SEC", &v)?;
        }
        if let Some(v) = var("LEASE_DURATION_SEC") {
            self.lease_duration_sec = parse_number("LEASE_DURATION_SEC", &v)?;
        }
        if let Some(v) = var("LEASE_OPERATION_TIMEOUT_SEC") {
            self.lease_operation_timeout_sec = parse_number("LEASE_OPERATION_TIMEOUT_SEC", &v)?;
        }
        if let Some(v) = var("RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = parse_number("RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("RETRY_BACKOFF") {
            self.retry_backoff = v;
        }
        if let Some(v) = var("RETRY_DELAY_MS") {
            self.retry_delay_ms = parse_number("RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = var("STOP_GRACE_SEC") {
            self.stop_grace_sec = parse_number("STOP_GRACE_SEC", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.cluster_id.trim().is_empty() {
            return Err(DomainError::InvalidConfiguration(
                "cluster_id must be set".to_string(),
            ));
        }
        if self.check_interval_sec == 0 {
            return Err(DomainError::InvalidConfiguration(
                "check_interval_sec must be positive".to_string(),
            ));
        }
        if !(MIN_LEASE_DURATION_SEC..=MAX_LEASE_DURATION_SEC).contains(&self.lease_duration_sec) {
            return Err(DomainError::InvalidConfiguration(format!(
                "lease_duration_sec must be between {} and {}, got {}",
                MIN_LEASE_DURATION_SEC, MAX_LEASE_DURATION_SEC, self.lease_duration_sec
            )));
        }
        if self.lease_operation_timeout_sec == 0 {
            return Err(DomainError::InvalidConfiguration(
                "lease_operation_timeout_sec must be positive".to_string(),
            ));
        }
        self.retry_policy()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, DomainError> {
        let backoff = Backoff::parse(
            &self.retry_backoff,
            Duration::from_millis(self.retry_delay_ms),
            MAX_RETRY_DELAY,
        )
        .ok_or_else(|| {
            DomainError::InvalidConfiguration(format!(
                "retry_backoff must be 'fixed' or 'exponential', got '{}'",
                self.retry_backoff
            ))
        })?;
        Ok(RetryPolicy::new(self.retry_max_attempts, backoff))
    }

    pub fn lease_settings(&self) -> Result<LeaseSettings, DomainError> {
        Ok(LeaseSettings {
            duration: Duration::from_secs(self.lease_duration_sec),
            operation_timeout: Duration::from_secs(self.lease_operation_timeout_sec),
            retry: self.retry_policy()?,
        })
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_sec)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, DomainError> {
    value.trim().parse().map_err(|_| {
        DomainError::InvalidConfiguration(format!(
            "{}{} must be a number, got '{}'",
            ENV_PREFIX, name, value
        ))
    })
}

/// Config file to use when none is given explicitly
pub fn get_default_config_path() -> Option<PathBuf> {
    // 1. DEPLOYER_CONFIG_FILE environment variable
    if let Ok(path) = std::env::var("DEPLOYER_CONFIG_FILE") {
        return Some(PathBuf::from(path));
    }

    // 2. Default location
    let default = Path::new(DEFAULT_CONFIG_PATH);
    if default.is_file() {
        return Some(default.to_path_buf());
    }

    None
}

/// Load the agent configuration from a YAML file
pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, DomainError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DomainError::InvalidConfiguration(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_agent_config(&content)
}

pub fn parse_agent_config(content: &str) -> Result<AgentConfig, DomainError> {
    if content.trim().is_empty() {
        return Ok(AgentConfig::default());
    }
    serde_yaml::from_str(content)
        .map_err(|e| DomainError::InvalidConfiguration(format!("Failed to parse config: {}", e)))
}

/// Runtime configuration of one application (`app.yaml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Executable, relative to the install directory
    pub exe_name: String,

    #[serde(default)]
    pub exe_args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// "inherit" (default), "null" or a file path
    #[serde(default)]
    pub stdout: Option<String>,

    #[serde(default)]
    pub stderr: Option<String>,

    #[serde(default)]
    pub monitor_initialization: bool,

    #[serde(default)]
    pub monitor_health: bool,

    #[serde(default)]
    pub graceful_shutdown: bool,

    #[serde(default = "default_initialization_timeout")]
    pub initialization_timeout_sec: u64,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_sec: u64,

    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
}

fn default_initialization_timeout() -> u64 {
    DEFAULT_INITIALIZATION_TIMEOUT_SEC
}

fn default_health_check_interval() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_SEC
}

fn default_max_restart_attempts() -> u32 {
    DEFAULT_MAX_RESTART_ATTEMPTS
}

impl AppConfig {
    pub fn new(exe_name: impl Into<String>) -> Self {
        Self {
            exe_name: exe_name.into(),
            exe_args: Vec::new(),
            env: HashMap::new(),
            stdout: None,
            stderr: None,
            monitor_initialization: false,
            monitor_health: false,
            graceful_shutdown: false,
            initialization_timeout_sec: DEFAULT_INITIALIZATION_TIMEOUT_SEC,
            health_check_interval_sec: DEFAULT_HEALTH_CHECK_INTERVAL_SEC,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
        }
    }

    pub fn initialization_timeout(&self) -> Duration {
        Duration::from_secs(self.initialization_timeout_sec)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_sec)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.exe_name.trim().is_empty() {
            return Err(DomainError::InvalidConfiguration(
                "exe_name must be set".to_string(),
            ));
        }
        if Path::new(&self.exe_name).is_absolute() {
            return Err(DomainError::InvalidConfiguration(format!(
                "exe_name must be relative to the install directory, got '{}'",
                self.exe_name
            )));
        }
        if self.monitor_initialization && self.initialization_timeout_sec == 0 {
            return Err(DomainError::InvalidConfiguration(
                "initialization_timeout_sec must be positive".to_string(),
            ));
        }
        if self.monitor_health && self.health_check_interval_sec == 0 {
            return Err(DomainError::InvalidConfiguration(
                "health_check_interval_sec must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read `app.yaml` from an install directory
pub async fn load_app_config(install_path: &Path) -> Result<AppConfig, DomainError> {
    let path = install_path.join(APP_CONFIG_FILE);
    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
        DomainError::InvalidConfiguration(format!(
            "Failed to read '{}': {}",
            path.display(),
            e
        ))
    })?;
    let config: AppConfig = serde_yaml::from_str(&content).map_err(|e| {
        DomainError::InvalidConfiguration(format!("Failed to parse '{}': {}", path.display(), e))
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_agent_config() {
        let yaml = r#"
cluster_id: prod-eu
instance_id: node-7
update_domain: "2"
cluster_properties:
  region: eu-west
repository_root: /mnt/share/deployments
applications_root: /srv/apps
ipc_dir: /run/deployer
check_interval_sec: 15
lease_duration_sec: 30
retry_backoff: fixed
retry_delay_ms: 250
"#;
        let config = parse_agent_config(yaml).unwrap();

        assert_eq!(config.cluster_id, "prod-eu");
        assert_eq!(config.update_domain, "2");
        assert_eq!(config.cluster_properties.get("region").unwrap(), "eu-west");
        assert_eq!(config.check_interval(), Duration::from_secs(15));
        assert_eq!(config.lease_duration_sec, 30);
        assert_eq!(config.stop_grace_sec, DEFAULT_STOP_GRACE_SEC);
        assert_eq!(
            config.retry_policy().unwrap().backoff(),
            Backoff::Fixed(Duration::from_millis(250))
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_agent_config("").unwrap();
        assert_eq!(config.check_interval_sec, DEFAULT_CHECK_INTERVAL_SEC);
        assert_eq!(config.lease_duration_sec, DEFAULT_LEASE_DURATION_SEC);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        let result = parse_agent_config("cluster_id: [unterminated");
        assert!(matches!(result, Err(DomainError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DEPLOYER_CLUSTER_ID", "staging"),
            ("DEPLOYER_LEASE_DURATION_SEC", "20"),
            ("DEPLOYER_IPC_DIR", "/tmp/ipc"),
        ]);
        let mut config = AgentConfig::default();

        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.cluster_id, "staging");
        assert_eq!(config.lease_duration_sec, 20);
        assert_eq!(config.ipc_dir, PathBuf::from("/tmp/ipc"));
    }

    #[test]
    fn test_env_override_must_be_numeric() {
        let mut config = AgentConfig::default();
        let result = config.apply_overrides(|name| {
            (name == "DEPLOYER_CHECK_INTERVAL_SEC").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(DomainError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_validate_lease_bounds() {
        let mut config = AgentConfig {
            cluster_id: "c1".to_string(),
            ..Default::default()
        };
        config.lease_duration_sec = 5;
        assert!(config.validate().is_err());
        config.lease_duration_sec = 61;
        assert!(config.validate().is_err());
        config.lease_duration_sec = 10;
        assert!(config.validate().is_ok());
        config.retry_backoff = "linear".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_app_config_defaults() {
        let config: AppConfig = serde_yaml::from_str("exe_name: bin/web\n").unwrap();

        assert_eq!(config, AppConfig::new("bin/web"));
        config.validate().unwrap();
    }

    #[test]
    fn test_app_config_rejects_absolute_exe() {
        assert!(AppConfig::new("/usr/bin/web").validate().is_err());
        assert!(AppConfig::new("").validate().is_err());
    }

    #[tokio::test]
    async fn test_load_app_config_from_install_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(APP_CONFIG_FILE),
            "exe_name: web\nexe_args: [\"--port\", \"${port}\"]\nmonitor_initialization: true\ninitialization_timeout_sec: 5\n",
        )
        .unwrap();

        let config = load_app_config(dir.path()).await.unwrap();

        assert_eq!(config.exe_args, vec!["--port", "${port}"]);
        assert!(config.monitor_initialization);
        assert_eq!(config.initialization_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_app_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_app_config(dir.path()).await;
        assert!(matches!(result, Err(DomainError::InvalidConfiguration(_))));
    }
}
