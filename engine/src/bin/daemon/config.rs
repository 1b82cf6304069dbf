//! Daemon configuration from environment variables
//!
//! Only what is needed before the agent config can be read lives here;
//! everything else comes from the YAML file and its `DEPLOYER_*` overrides.

use std::env;
use std::path::PathBuf;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Daemon configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Agent config file path
    pub config_file: Option<PathBuf>,

    /// Where update-session leases are kept
    pub lease_backend: LeaseBackend,

    /// Log level
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum LeaseBackend {
    /// Lease files on the shared repository directory
    #[default]
    File,
    /// Process-local; only safe with a single instance per cluster
    Memory,
}

impl DaemonConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            config_file: env::var("DEPLOYER_CONFIG_FILE").ok().map(PathBuf::from),
            lease_backend: Self::parse_lease_backend(),
            log_level: Self::parse_log_level(),
        }
    }

    fn parse_lease_backend() -> LeaseBackend {
        env::var("DEPLOYER_LEASE_BACKEND")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "file" => Some(LeaseBackend::File),
                "memory" => Some(LeaseBackend::Memory),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn parse_log_level() -> String {
        // Priority: DEPLOYER_LOG_LEVEL > RUST_LOG > default
        env::var("DEPLOYER_LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(path) = &self.config_file {
            if !path.is_file() {
                return Err(format!(
                    "DEPLOYER_CONFIG_FILE '{}' does not exist",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}
