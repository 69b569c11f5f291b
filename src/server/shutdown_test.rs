//! Tests for process stop coordination

use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_signal_starts_running() {
    let (_controller, signal) = shutdown_channel();

    assert!(!signal.is_shutdown());
    assert_eq!(signal.reason(), None);
}

#[tokio::test]
async fn test_every_clone_sees_the_stop() {
    let (controller, signal) = shutdown_channel();
    let listener = signal.clone();
    let monitor = signal.clone();

    controller.shutdown_because("SIGTERM");

    for held in [&signal, &listener, &monitor] {
        assert!(held.is_shutdown());
        assert_eq!(held.reason(), Some("SIGTERM"));
    }
}

#[tokio::test]
async fn test_first_reason_wins() {
    let (controller, signal) = shutdown_channel();

    controller.shutdown_because("api stopped");
    controller.shutdown_because("SIGINT");
    controller.shutdown();

    assert_eq!(signal.reason(), Some("api stopped"));
}

#[tokio::test]
async fn test_wait_returns_after_stop() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    tokio::time::timeout(Duration::from_secs(1), signal.wait())
        .await
        .expect("wait() should return once stopped");
    assert_eq!(signal.reason(), Some("requested"));
}

#[tokio::test]
async fn test_cancelled_resolves_for_graceful_shutdown() {
    let (controller, signal) = shutdown_channel();
    let waiter = tokio::spawn(signal.clone().cancelled());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    controller.shutdown_because("SIGTERM");
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("cancelled() should resolve after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_dropped_controller_releases_waiters() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;

    assert!(result.is_ok());
    assert!(!signal.is_shutdown());
}
