/// E2E tests for update sessions shared between instances through lease files
use deployer_engine::domain::ports::UpdateSessionManager;
use deployer_engine::domain::services::{LeaseSettings, LeaseUpdateSessionManager};
use deployer_engine::domain::RetryPolicy;
use deployer_engine::infrastructure::FileLeaseStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn instance(leases: &Path, update_domain: &str) -> LeaseUpdateSessionManager {
    LeaseUpdateSessionManager::new(
        Arc::new(FileLeaseStore::new(leases)),
        "prod",
        update_domain,
        LeaseSettings {
            duration: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            retry: RetryPolicy::no_retry(),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_e2e_one_update_domain_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let domain_a = instance(dir.path(), "0");
    let domain_b = instance(dir.path(), "1");

    assert!(domain_a.try_start_update_session("web").await.unwrap());
    assert!(!domain_b.try_start_update_session("web").await.unwrap());
    // Other applications are independent
    assert!(domain_b.try_start_update_session("api").await.unwrap());

    domain_a.end_update_session("web").await.unwrap();
    assert!(domain_b.try_start_update_session("web").await.unwrap());

    domain_b.end_update_session("web").await.unwrap();
    domain_b.end_update_session("api").await.unwrap();
    // Ending twice is harmless
    domain_b.end_update_session("api").await.unwrap();
}

#[tokio::test]
async fn test_e2e_concurrent_sessions_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let instances: Vec<_> = (0..5)
        .map(|i| instance(dir.path(), &i.to_string()))
        .collect();

    let results = futures::future::join_all(
        instances
            .iter()
            .map(|instance| instance.try_start_update_session("web")),
    )
    .await;

    let winners = results.iter().filter(|r| matches!(r, Ok(true))).count();
    assert_eq!(winners, 1);
    for instance in &instances {
        instance.end_update_session("web").await.unwrap();
    }
}
