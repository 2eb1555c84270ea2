// ABOUTME: Integration tests for the SSH reachability probe without a server.
// ABOUTME: The probe must keep retrying and give up only when cancelled.

mod support;

use hostwire::ssh::{ConnectConfig, check_ssh, check_ssh_every};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A local port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn unreachable_host_returns_false_once_cancelled() {
    support::init_tracing();
    let (_dir, store) = support::temp_store();
    store.ensure_root_keys_exist().unwrap();

    let config = ConnectConfig::new("127.0.0.1", "nobody").port(closed_port().await);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let reachable = check_ssh_every(&cancel, &config, &store, Duration::from_millis(50)).await;

    assert!(!reachable);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn already_cancelled_probe_returns_immediately() {
    let (_dir, store) = support::temp_store();
    store.ensure_root_keys_exist().unwrap();

    let config = ConnectConfig::new("127.0.0.1", "nobody").port(closed_port().await);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let reachable = tokio::time::timeout(Duration::from_secs(1), check_ssh(&cancel, &config, &store))
        .await
        .expect("cancelled probe should not wait");
    assert!(!reachable);
}

#[tokio::test]
async fn probe_without_trust_material_keeps_failing() {
    let (_dir, store) = support::temp_store();

    let config = ConnectConfig::new("127.0.0.1", "nobody").port(closed_port().await);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    assert!(!check_ssh_every(&cancel, &config, &store, Duration::from_millis(10)).await);
}

#[tokio::test]
async fn first_attempt_does_not_wait_for_the_interval() {
    support::init_tracing();
    let (_dir, store) = support::temp_store();
    store.ensure_root_keys_exist().unwrap();

    // Accepts TCP but never speaks SSH, so each attempt stays pending.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ConnectConfig::new("127.0.0.1", "nobody").port(port);

    let cancel = CancellationToken::new();
    let polling = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            check_ssh_every(&cancel, &config, &store, Duration::from_secs(60)).await
        })
    };

    let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
    assert!(accepted.is_ok(), "no connection attempt before the first interval elapsed");

    cancel.cancel();
    assert!(!polling.await.unwrap());
}

