//! Cluster application deployer
//!
//! Keeps the applications running on this instance in line with the
//! deployment manifest published to shared storage, one update domain at a time.

pub mod domain;
pub mod infrastructure;

pub use domain::{DomainError, Result};
