//! Shared helpers for the end-to-end tests
#![allow(dead_code)]

use deployer_engine::domain::ports::DeploymentRepository;
use deployer_engine::domain::{AppIdentity, ConflictMode};
use deployer_engine::infrastructure::LocalDeploymentRepository;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

/// Write an executable `#!/bin/sh` script
pub fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Build an application directory (`app.yaml` + `run.sh`) under `workdir` and upload it
pub async fn publish_app(
    repository: &LocalDeploymentRepository,
    workdir: &Path,
    identity: &AppIdentity,
    app_yaml: &str,
    script: &str,
) {
    let build = workdir.join(format!("build-{}-{}", identity.id(), identity.version()));
    std::fs::create_dir_all(&build).unwrap();
    std::fs::write(build.join("app.yaml"), app_yaml).unwrap();
    write_script(&build.join("run.sh"), script);
    repository
        .upload_application_binaries(identity, &build, ConflictMode::OverwriteExisting)
        .await
        .unwrap();
}

pub fn identity(id: &str, version: &str) -> AppIdentity {
    AppIdentity::parse(id, version).unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Whether a process with `pid` still exists
pub fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}
