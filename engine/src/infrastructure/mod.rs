//! Infrastructure Layer
//!
//! Adapters implementing the domain ports against the operating system and shared storage.
//!
//! ## Adapters
//!
//! - `TokioProcess`: child processes via tokio, stopped with SIGTERM/SIGKILL
//! - `ProcessApplicationFactory`: applications built from `app.yaml`, with IPC handshake channels
//! - `LocalDeploymentRepository`: manifest and binaries on a shared directory
//! - `RepositoryDeploymentDirectory` / `RepositoryApplicationDownloader`: desired set and downloads
//! - `FileLeaseStore` / `InMemoryLeaseStore`: lease storage for update sessions

pub mod config;
pub mod file_lease_store;
pub mod in_memory_lease_store;
pub mod ipc;
pub mod local_deployment_repository;
pub mod process_application;
pub mod repository_deployment_directory;
pub mod tokio_process;

pub use config::{
    get_default_config_path, load_app_config, load_config_from_path, AgentConfig, AppConfig,
};
pub use file_lease_store::FileLeaseStore;
pub use in_memory_lease_store::InMemoryLeaseStore;
pub use local_deployment_repository::LocalDeploymentRepository;
pub use process_application::{
    expand_placeholders, HandshakeSettings, ProcessApplication, ProcessApplicationFactory,
};
pub use repository_deployment_directory::{
    RepositoryApplicationDownloader, RepositoryDeploymentDirectory,
};
pub use tokio_process::TokioProcess;
