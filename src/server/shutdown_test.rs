use super::shutdown::*;
use std::time::Duration;

const WAIT_LIMIT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn test_every_listener_sees_shutdown() {
    let (controller, leader_signal) = shutdown_channel();
    let health_signal = leader_signal.clone();
    assert!(!leader_signal.is_shutdown());

    controller.shutdown();

    assert!(leader_signal.is_shutdown());
    assert!(health_signal.is_shutdown());
}

#[tokio::test]
async fn test_background_task_stops_on_shutdown() {
    let (controller, mut signal) = shutdown_channel();
    let task = tokio::spawn(async move {
        signal.wait().await;
        "stopped"
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!task.is_finished());

    controller.shutdown();
    let outcome = tokio::time::timeout(WAIT_LIMIT, task).await;
    assert_eq!(outcome.unwrap().unwrap(), "stopped");
}

#[tokio::test]
async fn test_wait_after_shutdown_returns_immediately() {
    let (controller, mut signal) = shutdown_channel();
    controller.shutdown();

    assert!(tokio::time::timeout(WAIT_LIMIT, signal.wait()).await.is_ok());
}

#[tokio::test]
async fn test_dropped_controller_releases_waiters() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    assert!(tokio::time::timeout(WAIT_LIMIT, signal.wait()).await.is_ok());
}
