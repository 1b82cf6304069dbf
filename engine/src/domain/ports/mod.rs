pub mod application;
pub mod deployment_repository;
pub mod lease_store;
pub mod process;

pub use application::{Application, ApplicationExitEvent, ApplicationFactory};
pub use deployment_repository::{ApplicationDownloader, DeploymentDirectory, DeploymentRepository};
#[cfg(test)]
pub use lease_store::{MockLeaseStore, MockUpdateSessionManager};
pub use lease_store::{LeaseId, LeaseStore, UpdateSessionManager};
pub use process::{wait_for_exit, Process, ProcessExitEvent, EXIT_EVENT_CAPACITY};
