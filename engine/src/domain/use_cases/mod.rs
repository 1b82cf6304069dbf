pub mod check_for_updates;
pub mod install_application;

pub use check_for_updates::{ApplicationUpdateManager, CheckForUpdatesUseCase, UpdateReport};
pub use install_application::{install_path, ApplicationInstaller, InstallApplicationUseCase};
