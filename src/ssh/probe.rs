// ABOUTME: SSH reachability probe: retries a full connect until it works or is cancelled.
// ABOUTME: Cancellation is the only bound; there is no retry limit.

use super::client::{Client, ConnectConfig};
use crate::config::ProbeConfig;
use crate::trust::TrustStore;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Poll `config`'s host once per second until an authenticated connection
/// succeeds. Returns `false` as soon as `cancel` fires.
///
/// The first attempt is made right away; the pause only separates retries.
pub async fn check_ssh(cancel: &CancellationToken, config: &ConnectConfig, store: &TrustStore) -> bool {
    check_ssh_every(cancel, config, store, ProbeConfig::default().interval).await
}

/// [`check_ssh`] with a custom pause between attempts. Attempts start
/// immediately, not one `interval` after the call.
pub async fn check_ssh_every(
    cancel: &CancellationToken,
    config: &ConnectConfig,
    store: &TrustStore,
    interval: Duration,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            connected = Client::connect(config.clone(), store) => connected,
        };

        match connected {
            Ok(client) => {
                if let Err(e) = client.close().await {
                    tracing::warn!("closing probe connection to {} failed: {}", config.host_port(), e);
                }
                tracing::debug!("{} reachable after {} attempt(s)", config.host_port(), attempt);
                return true;
            }
            Err(e) => tracing::debug!("{} not reachable yet: {}", config.host_port(), e),
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
