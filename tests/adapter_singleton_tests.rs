//! Integration tests for the process-wide tunnel adapter
//!
//! All tests share one adapter, installed on first use with a simulated
//! platform that only moves when a test reports a transition. Tests that
//! drive transitions run serially and leave the tunnel disconnected.

use libtunnelctl::{
    SimulatedPlatform, TunnelAdapter, TunnelProfile, TunnelStatus, TunnelctlConfig, TunnelctlError,
    STATUS_CHANGED,
};
use serial_test::serial;
use std::sync::{Arc, OnceLock};
use std::thread;
use tokio::sync::broadcast::error::TryRecvError;

static PLATFORM: OnceLock<SimulatedPlatform> = OnceLock::new();

fn shared_adapter() -> (Arc<TunnelAdapter>, SimulatedPlatform) {
    let platform = PLATFORM
        .get_or_init(|| {
            let platform = SimulatedPlatform::with_profile(TunnelProfile::new("MyVPN", "MyVPN"));
            TunnelAdapter::install(Arc::new(platform.clone()), &TunnelctlConfig::default())
                .expect("adapter installed once");
            platform
        })
        .clone();
    (TunnelAdapter::shared(), platform)
}

#[test]
fn test_shared_returns_one_instance() {
    let (first, _) = shared_adapter();

    let handles: Vec<_> = (0..16)
        .map(|_| thread::spawn(TunnelAdapter::shared))
        .collect();

    for handle in handles {
        let adapter = handle.join().unwrap();
        assert!(Arc::ptr_eq(&first, &adapter));
    }
}

#[test]
fn test_second_install_is_rejected() {
    let _ = shared_adapter();

    let result = TunnelAdapter::install(Arc::new(SimulatedPlatform::new()), &TunnelctlConfig::default());
    assert!(matches!(result, Err(TunnelctlError::AlreadyExists(_))));
    assert!(TunnelAdapter::try_shared().is_some());
}

#[tokio::test]
#[serial]
async fn test_default_configuration() {
    let (adapter, _) = shared_adapter();

    assert_eq!(adapter.display_name(), "MyVPN");
    assert_eq!(adapter.server_address(), "MyVPN");
    assert_eq!(adapter.status(), TunnelStatus::Disconnected);
}

#[tokio::test]
#[serial]
async fn test_start_stop_notifications() {
    let (adapter, platform) = shared_adapter();
    let mut rx = adapter.subscribe();
    let starts_before = platform.start_requests().len();

    adapter.start_tunnel(None).await.unwrap();
    assert_eq!(platform.start_requests().len(), starts_before + 1);
    assert_eq!(platform.start_requests().last(), Some(&None));

    let mut notifications = 0;
    for status in [TunnelStatus::Connecting, TunnelStatus::Connected] {
        platform.report(status);
        let notification = rx.recv().await.unwrap();
        notifications += 1;
        assert_eq!(notification.name, STATUS_CHANGED);
        assert_eq!(adapter.status(), status);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
    assert_eq!(notifications, 2);

    adapter.stop_tunnel().await.unwrap();
    for status in [TunnelStatus::Disconnecting, TunnelStatus::Disconnected] {
        platform.report(status);
        rx.recv().await.unwrap();
        notifications += 1;
        assert_eq!(adapter.status(), status);
    }

    assert_eq!(notifications, 4);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(adapter.status(), TunnelStatus::Disconnected);
}

#[tokio::test]
#[serial]
async fn test_stop_when_idle() {
    let (adapter, _) = shared_adapter();
    let mut rx = adapter.subscribe();

    adapter.stop_tunnel().await.unwrap();

    assert_eq!(adapter.status(), TunnelStatus::Disconnected);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
#[serial]
async fn test_reasserting_keeps_tunnel() {
    let (adapter, platform) = shared_adapter();
    let mut rx = adapter.subscribe();

    for status in [
        TunnelStatus::Connecting,
        TunnelStatus::Connected,
        TunnelStatus::Reasserting,
        TunnelStatus::Connected,
        TunnelStatus::Disconnecting,
        TunnelStatus::Disconnected,
    ] {
        platform.report(status);
        rx.recv().await.unwrap();
        assert_eq!(adapter.status(), status);
    }
}
