//! Module-ready signal tests.

mod common;

use common::{fixture_wat, Fixture};
use dtln_bridge::{BridgeConfig, BridgeError, ContextSelection, DenoiseBridge, BLOCK_SIZE};

fn config() -> BridgeConfig {
    BridgeConfig::default()
        .context(ContextSelection::Host)
        .optimize(0)
}

#[tokio::test]
async fn test_create_after_ready_signal() {
    let mut bridge = DenoiseBridge::spawn(config(), fixture_wat(Fixture::Stable)).unwrap();

    // Before the signal, create either refuses or the load already finished.
    match bridge.create() {
        Err(BridgeError::NotReady) => {}
        Ok(handle) => bridge.destroy(handle),
        Err(other) => panic!("unexpected error before ready: {}", other),
    }

    bridge.ready().await.unwrap();
    assert!(bridge.is_ready());

    let handle = bridge.create().unwrap();
    let mut out = [0.0f32; BLOCK_SIZE];
    bridge.process(&handle, &[0.5; BLOCK_SIZE], &mut out).unwrap();
    bridge.destroy(handle);
}

#[tokio::test]
async fn test_load_failure_is_sticky() {
    let mut bridge = DenoiseBridge::spawn(config(), b"\0asm broken".to_vec()).unwrap();

    assert!(matches!(bridge.ready().await, Err(BridgeError::LoadFailed(_))));
    assert!(!bridge.is_ready());
    assert!(matches!(bridge.create(), Err(BridgeError::LoadFailed(_))));
    assert!(matches!(bridge.ready().await, Err(BridgeError::LoadFailed(_))));
    assert!(bridge.shim_report().is_none());
}

#[test]
fn test_wait_ready_blocking() {
    let mut bridge = DenoiseBridge::spawn(config(), fixture_wat(Fixture::Stable)).unwrap();
    bridge.wait_ready().unwrap();
    assert!(bridge.is_ready());
    assert!(bridge.shim_report().is_some());
}

#[test]
fn test_poll_until_ready() {
    let mut bridge = DenoiseBridge::spawn(config(), fixture_wat(Fixture::Stable)).unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while !bridge.is_ready() {
        assert!(std::time::Instant::now() < deadline, "module never became ready");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    let handle = bridge.create().unwrap();
    bridge.destroy(handle);
}

#[test]
fn test_invalid_config_rejected_at_spawn() {
    let result = DenoiseBridge::spawn(config().sample_rate(0), fixture_wat(Fixture::Stable));
    assert!(matches!(result, Err(BridgeError::ConfigError(_))));
}
