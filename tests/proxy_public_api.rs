//! Integration tests for the proxy public API.
//!
//! These tests exercise the public surface: configuration validation,
//! shutdown behavior, and the capacity accounting visible through the
//! handle. They use only loopback endpoints that refuse connections, so
//! they never leave the machine.

use std::time::Duration;

use floe::{NatType, Proxy, ProxyConfig};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A config whose endpoints all fail fast: nothing listens on port 1.
fn offline_config() -> ProxyConfig {
    ProxyConfig {
        broker_url: "http://127.0.0.1:1/".into(),
        relay_url: "ws://127.0.0.1:1/".into(),
        nat_probe_url: "http://127.0.0.1:1/probe".into(),
        stun_url: "stun:127.0.0.1:1".into(),
        relay_domain_pattern: "127.0.0.1".into(),
        allow_non_tls_relay: true,
        // Keep the background tasks quiet.
        nat_retest_interval: Duration::ZERO,
        summary_interval: Duration::ZERO,
        ..Default::default()
    }
}

#[test]
fn default_config_builds() {
    let proxy = Proxy::new(ProxyConfig::default()).expect("default config should build");
    assert_eq!(proxy.nat_type(), NatType::Unknown);
    assert_eq!(proxy.in_flight(), 0);
}

#[test]
fn invalid_configs_are_startup_errors() {
    assert!(Proxy::new(ProxyConfig {
        broker_url: "not a url".into(),
        ..Default::default()
    })
    .is_err());

    assert!(Proxy::new(ProxyConfig {
        relay_domain_pattern: "bad pattern with spaces".into(),
        ..Default::default()
    })
    .is_err());

    assert!(Proxy::new(ProxyConfig {
        ephemeral_min_port: 50000,
        ephemeral_max_port: 40000,
        ..Default::default()
    })
    .is_err());
}

#[tokio::test]
async fn stop_is_idempotent_and_works_before_start() {
    let proxy = Proxy::new(offline_config()).unwrap();
    proxy.stop();
    proxy.stop();

    // A pre-stopped proxy's start() must return promptly.
    let result = timeout(TEST_TIMEOUT, proxy.start()).await;
    assert!(result.is_ok(), "start did not observe the earlier stop");
    result.unwrap().expect("start should exit cleanly");
}

#[tokio::test]
async fn start_unwinds_on_stop() {
    let proxy = Proxy::new(offline_config()).unwrap();

    let runner = proxy.clone();
    let serving = tokio::spawn(async move { runner.start().await });

    // Let the proxy get into its poll loop (the NAT probe and broker
    // polls all fail fast against the refused ports).
    tokio::time::sleep(Duration::from_millis(500)).await;
    proxy.stop();

    let result = timeout(TEST_TIMEOUT, serving)
        .await
        .expect("start did not unwind after stop")
        .expect("proxy task panicked");
    assert!(result.is_ok(), "start returned an error: {result:?}");

    // All tokens must be back after shutdown.
    assert_eq!(proxy.in_flight(), 0);
}

#[tokio::test]
async fn clones_drive_the_same_instance() {
    let proxy = Proxy::new(offline_config()).unwrap();
    let clone = proxy.clone();

    let serving = tokio::spawn(async move { clone.start().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Stopping through the original handle stops the cloned runner.
    proxy.stop();
    let result = timeout(TEST_TIMEOUT, serving)
        .await
        .expect("cloned runner did not observe stop")
        .expect("proxy task panicked");
    assert!(result.is_ok());
}
