//! Domain-level errors
//! Grouped by how the reconciliation loop treats them: skip, reject, retry or give up

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    // Not-found errors (recoverable, the item is skipped)
    #[error("Application '{0}' not found")]
    ApplicationNotFound(String),

    #[error("Binaries for '{0}' not found in the deployment repository")]
    BinariesNotFound(String),

    #[error("Deployment config not found: {0}")]
    DeploymentConfigNotFound(String),

    // Duplicate / conflict errors
    #[error("Application '{0}' is already registered")]
    DuplicateApplication(String),

    #[error("Binaries for '{0}' already exist in the deployment repository")]
    DuplicateBinaries(String),

    #[error("Process is already running (PID: {0})")]
    AlreadyRunning(u32),

    #[error("Connection '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("Lease on '{0}' is held by another owner")]
    LeaseAlreadyHeld(String),

    // State errors
    #[error("Connection '{0}' is not connected")]
    NotConnected(String),

    #[error("Process is still running (PID: {0})")]
    StillRunning(u32),

    #[error("Process has not been started")]
    NotStarted,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    // Infrastructure errors
    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Process failure: {0}")]
    ProcessFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{} operation(s) failed: {}", .0.len(), .0.join("; "))]
    Aggregate(Vec<String>),
}

impl DomainError {
    /// Faults worth retrying: the storage was unavailable or a concurrent
    /// renew raced with us. Everything else is a bug or a final answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::Transient(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DomainError::Timeout(_))
    }
}

impl From<std::io::Error> for DomainError {
    fn from(e: std::io::Error) -> Self {
        DomainError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for DomainError {
    fn from(e: serde_yaml::Error) -> Self {
        DomainError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
