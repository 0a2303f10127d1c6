use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
    time::SystemTime,
};

use parking_lot::Mutex;

use crate::{
    error::CoreError,
    model::{Bridge, Network, Peer, PeerSnapshot},
};

/// A pure in-memory [`super::Store`], requiring no filesystem or privilege,
/// used to exercise the lifecycle manager, reconciler and monitor loops in
/// tests without a real SQLite file.
#[derive(Default)]
pub struct InMemoryStore {
    next_id: AtomicI64,
    networks: Mutex<HashMap<i64, Network>>,
    peers: Mutex<HashMap<i64, Peer>>,
    bridges: Mutex<HashMap<i64, Bridge>>,
    snapshots: Mutex<Vec<PeerSnapshot>>,
    settings: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl super::Store for InMemoryStore {
    fn list_networks(&self) -> Result<Vec<Network>, CoreError> {
        Ok(self.networks.lock().values().cloned().collect())
    }

    fn get_network(&self, id: i64) -> Result<Network, CoreError> {
        self.networks
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("network {id}")))
    }

    fn create_network(&self, mut network: Network) -> Result<Network, CoreError> {
        network.id = self.allocate_id();
        self.networks.lock().insert(network.id, network.clone());
        Ok(network)
    }

    fn update_network(&self, network: &Network) -> Result<(), CoreError> {
        let mut networks = self.networks.lock();
        if !networks.contains_key(&network.id) {
            return Err(CoreError::NotFound(format!("network {}", network.id)));
        }
        networks.insert(network.id, network.clone());
        Ok(())
    }

    fn delete_network(&self, id: i64) -> Result<(), CoreError> {
        self.networks.lock().remove(&id);
        Ok(())
    }

    fn list_peers_by_network(&self, network_id: i64) -> Result<Vec<Peer>, CoreError> {
        Ok(self
            .peers
            .lock()
            .values()
            .filter(|p| p.network_id == network_id)
            .cloned()
            .collect())
    }

    fn get_peer(&self, id: i64) -> Result<Peer, CoreError> {
        self.peers
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("peer {id}")))
    }

    fn create_peer(&self, mut peer: Peer) -> Result<Peer, CoreError> {
        peer.id = self.allocate_id();
        self.peers.lock().insert(peer.id, peer.clone());
        Ok(peer)
    }

    fn update_peer(&self, peer: &Peer) -> Result<(), CoreError> {
        let mut peers = self.peers.lock();
        if !peers.contains_key(&peer.id) {
            return Err(CoreError::NotFound(format!("peer {}", peer.id)));
        }
        peers.insert(peer.id, peer.clone());
        Ok(())
    }

    fn delete_peer(&self, id: i64) -> Result<(), CoreError> {
        self.peers.lock().remove(&id);
        Ok(())
    }

    fn list_expired_peers(&self, now: SystemTime) -> Result<Vec<Peer>, CoreError> {
        Ok(self
            .peers
            .lock()
            .values()
            .filter(|p| p.enabled && p.is_expired(now))
            .cloned()
            .collect())
    }

    fn list_bridges(&self) -> Result<Vec<Bridge>, CoreError> {
        Ok(self.bridges.lock().values().cloned().collect())
    }

    fn create_bridge(&self, mut bridge: Bridge) -> Result<Bridge, CoreError> {
        bridge.id = self.allocate_id();
        self.bridges.lock().insert(bridge.id, bridge.clone());
        Ok(bridge)
    }

    fn delete_bridge(&self, id: i64) -> Result<(), CoreError> {
        self.bridges.lock().remove(&id);
        Ok(())
    }

    fn insert_snapshot(&self, snapshot: &PeerSnapshot) -> Result<(), CoreError> {
        self.snapshots.lock().push(*snapshot);
        Ok(())
    }

    fn list_snapshots(
        &self,
        peer_id: i64,
        since: SystemTime,
        until: SystemTime,
    ) -> Result<Vec<PeerSnapshot>, CoreError> {
        Ok(self
            .snapshots
            .lock()
            .iter()
            .filter(|s| s.peer_id == peer_id && s.timestamp >= since && s.timestamp <= until)
            .cloned()
            .collect())
    }

    fn compact_snapshots(&self, cutoff: SystemTime) -> Result<usize, CoreError> {
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|s| s.timestamp >= cutoff);
        Ok(before - snapshots.len())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>, CoreError> {
        Ok(self.settings.lock().get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.settings.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
