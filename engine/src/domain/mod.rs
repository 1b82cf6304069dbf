pub mod constants;
pub mod error;
pub mod ports;
pub mod services;
pub mod use_cases;
pub mod value_objects;

pub use error::{DomainError, Result};
pub use value_objects::{
    AppDeploymentConfig, AppIdentity, AppInstallConfig, AppVersion, Backoff, ConflictMode,
    DeploymentConfig, ProcessState, RetryPolicy,
};
