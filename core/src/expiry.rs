//! Periodically disables and removes peers whose `expires_at` has passed
//! (§4.8).

use std::{sync::Arc, time::{Duration, SystemTime}};

use tokio_util::sync::CancellationToken;

use crate::{lifecycle::LifecycleManager, store::Store};

pub struct ExpiryChecker {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleManager>,
}

impl ExpiryChecker {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<LifecycleManager>) -> Self {
        Self { store, lifecycle }
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("expiry checker: cancellation received, exiting");
                    return;
                },
                _ = ticker.tick() => {
                    self.check_once();
                },
            }
        }
    }

    /// Disables and removes every peer whose expiry has passed. Failures
    /// are logged; the loop continues with the next peer.
    pub fn check_once(&self) {
        let expired = match self.store.list_expired_peers(SystemTime::now()) {
            Ok(peers) => peers,
            Err(err) => {
                log::error!("expiry checker: failed to list expired peers: {err}");
                return;
            },
        };

        let mut disabled = 0usize;
        for mut peer in expired {
            let peer_id = peer.id;
            peer.enabled = false;
            if let Err(err) = self.store.update_peer(&peer) {
                log::error!("expiry checker: failed to disable peer {peer_id}: {err}");
                continue;
            }

            let network = match self.store.get_network(peer.network_id) {
                Ok(network) => network,
                Err(err) => {
                    log::error!(
                        "expiry checker: failed to look up network {} for expired peer {peer_id}: {err}",
                        peer.network_id
                    );
                    disabled += 1;
                    continue;
                },
            };

            if network.enabled {
                if let Err(err) = self.lifecycle.remove_peer(&network.interface_name, &peer.public_key) {
                    log::error!("expiry checker: failed to remove expired peer {peer_id} from kernel: {err}");
                }
            }

            log::info!("expiry checker: disabled expired peer {peer_id}");
            disabled += 1;
        }

        log::info!("expiry checker: {disabled} peer(s) disabled this cycle");
    }
}
