pub mod app_identity;
pub mod app_install_config;
pub mod app_version;
pub mod conflict_mode;
pub mod deployment_config;
pub mod process_state;
pub mod retry_policy;

pub use app_identity::AppIdentity;
pub use app_install_config::AppInstallConfig;
pub use app_version::AppVersion;
pub use conflict_mode::ConflictMode;
pub use deployment_config::{AppDeploymentConfig, DeploymentConfig};
pub use process_state::ProcessState;
pub use retry_policy::{Backoff, RetryPolicy};
