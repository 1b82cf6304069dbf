//! Domain Constants
//!
//! Common constants used throughout the domain layer

/// Minimum lease duration accepted by the update session manager, in seconds
pub const MIN_LEASE_DURATION_SEC: u64 = 10;

/// Maximum lease duration accepted by the update session manager, in seconds
pub const MAX_LEASE_DURATION_SEC: u64 = 60;

/// Default lease duration in seconds
pub const DEFAULT_LEASE_DURATION_SEC: u64 = 60;

/// A held lease is renewed this many seconds before it would expire
pub const LEASE_RENEWAL_MARGIN_SEC: u64 = 9;

/// Default timeout for a single lease-manager call visible to callers, in seconds
pub const DEFAULT_LEASE_OPERATION_TIMEOUT_SEC: u64 = 30;

/// Default number of retries for transient storage faults
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry, in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Exponential backoff base for retry delays
pub const RETRY_BACKOFF_BASE: u32 = 2;

/// Default grace period given to a process after a close request, in seconds
pub const DEFAULT_STOP_GRACE_SEC: u64 = 10;

/// Default time a child has to report `[INITIALIZE_DONE]`, in seconds
pub const DEFAULT_INITIALIZATION_TIMEOUT_SEC: u64 = 60;

/// Default heartbeat period expected on the health channel, in seconds
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SEC: u64 = 30;

/// Default timeout for a single IPC send, in seconds
pub const DEFAULT_IPC_SEND_TIMEOUT_SEC: u64 = 5;

/// Default number of automatic restarts after unexpected exits
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// Default reconciliation period, in seconds
pub const DEFAULT_CHECK_INTERVAL_SEC: u64 = 10;
