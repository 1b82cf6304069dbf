/// E2E tests for the handshake protocol between the agent and a child
use deployer_engine::infrastructure::ipc::{
    channel_path, request_exit, send_heartbeat, signal_initialization_done,
    wait_for_exit_request, wait_for_heartbeat, wait_for_initialization, ChannelKind,
    ChildChannels, IpcConnection, IpcError,
};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_e2e_full_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let init_path = channel_path(dir.path(), "web-1.0.0", ChannelKind::Init);
    let health_path = channel_path(dir.path(), "web-1.0.0", ChannelKind::Health);
    let exit_path = channel_path(dir.path(), "web-1.0.0", ChannelKind::Exit);

    let init = IpcConnection::listener("init", &init_path, TIMEOUT);
    let health = IpcConnection::listener("health", &health_path, TIMEOUT);
    let exit = IpcConnection::listener("exit", &exit_path, TIMEOUT);
    for channel in [&init, &health, &exit] {
        channel.listen().await.unwrap();
    }

    let child = tokio::spawn(async move {
        let init = IpcConnection::client("init", init_path, TIMEOUT);
        let health = IpcConnection::client("health", health_path, TIMEOUT);
        let exit = IpcConnection::client("exit", exit_path, TIMEOUT);
        init.connect().await.unwrap();
        health.connect().await.unwrap();
        exit.connect().await.unwrap();

        signal_initialization_done(&init).await.unwrap();
        send_heartbeat(&health).await.unwrap();
        send_heartbeat(&health).await.unwrap();
        wait_for_exit_request(&exit).await.unwrap();
    });

    let (a, b, c) = tokio::join!(init.connect(), health.connect(), exit.connect());
    a.unwrap();
    b.unwrap();
    c.unwrap();

    wait_for_initialization(&init, TIMEOUT).await.unwrap();
    wait_for_heartbeat(&health, TIMEOUT).await.unwrap();
    wait_for_heartbeat(&health, TIMEOUT).await.unwrap();
    request_exit(&exit).await.unwrap();

    tokio::time::timeout(TIMEOUT, child).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_e2e_peer_hangup_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = channel_path(dir.path(), "api-2.0.0", ChannelKind::Health);
    let agent = IpcConnection::listener("health", &path, TIMEOUT);
    let child = IpcConnection::client("health", &path, TIMEOUT);
    let (a, c) = tokio::join!(agent.connect(), child.connect());
    a.unwrap();
    c.unwrap();

    child.disconnect().await;

    assert!(matches!(
        wait_for_heartbeat(&agent, TIMEOUT).await,
        Err(IpcError::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn test_e2e_child_channels_absent_from_env() {
    // Only channels advertised in the environment are connected
    std::env::remove_var("DEPLOYER_INIT_PIPE");
    std::env::remove_var("DEPLOYER_HEALTH_PIPE");
    std::env::remove_var("DEPLOYER_EXIT_PIPE");

    let channels = ChildChannels::connect_from_env(Duration::from_millis(100))
        .await
        .unwrap();

    assert!(channels.init.is_none());
    assert!(channels.health.is_none());
    assert!(channels.exit.is_none());
}
