pub mod application_pool;
pub mod deployment_matcher;
pub mod deployment_watcher;
pub mod process_stopper;
pub mod self_restarting_process;
pub mod update_session;

pub use application_pool::ApplicationPool;
pub use deployment_matcher::{ClusterIdMatcher, ClusterPropertiesMatcher, DeploymentMatcher};
pub use deployment_watcher::DeploymentWatcher;
pub use process_stopper::ProcessStopper;
pub use self_restarting_process::SelfRestartingProcess;
pub use update_session::{
    update_lock_name, InMemoryUpdateSessionManager, LeaseSettings, LeaseUpdateSessionManager,
};
