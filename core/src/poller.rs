//! Periodically samples peer statistics off the kernel, writes snapshots,
//! and logs online/offline transitions (§4.6).

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use meshguard_control::{InterfaceName, Key};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    lifecycle::LifecycleManager,
    model::{Network, Peer, PeerSnapshot},
    store::Store,
};

/// Runs the poll loop. Holds its own lock over the previous-online map,
/// separate from the lifecycle manager's lock - a poll cycle never
/// serializes against lifecycle mutations beyond the per-interface reads
/// `PeerStatus` already does.
pub struct Poller {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleManager>,
    prev_online: Mutex<HashMap<i64, bool>>,
}

impl Poller {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            store,
            lifecycle,
            prev_online: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the poll loop on `interval` until `cancel` fires. `tokio::time::interval`
    /// completes its first tick immediately, so the very first iteration of
    /// this loop runs synchronously with no wait - test harnesses rely on
    /// that to observe a single poll's side effects without advancing a
    /// clock.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("poller: cancellation received, exiting");
                    return;
                },
                _ = ticker.tick() => {
                    self.poll_once();
                },
            }
        }
    }

    /// Runs exactly one poll cycle across every enabled network. Each
    /// failing kernel read or database write is logged; one failure never
    /// aborts the cycle.
    pub fn poll_once(&self) {
        let networks = match self.store.list_networks() {
            Ok(networks) => networks,
            Err(err) => {
                log::error!("poller: failed to list networks: {err}");
                return;
            },
        };

        for network in networks.iter().filter(|n| n.enabled) {
            self.poll_network(network);
        }
    }

    fn poll_network(&self, network: &Network) {
        let name = network.interface_name;
        let statuses = match self.lifecycle.peer_status(&name) {
            Ok(statuses) => statuses,
            Err(err) => {
                log::error!("poller: failed to read peer statuses for {name}: {err}");
                return;
            },
        };

        let db_peers = match self.store.list_peers_by_network(network.id) {
            Ok(peers) => peers,
            Err(err) => {
                log::error!("poller: failed to list peers for network {}: {err}", network.name);
                return;
            },
        };
        let by_key: HashMap<Key, &Peer> = db_peers.iter().map(|p| (p.public_key.clone(), p)).collect();

        let now = SystemTime::now();
        for status in &statuses {
            let Some(peer) = by_key.get(&status.public_key) else {
                // Kernel peer with no matching DB row - silently dropped,
                // per §4.6 point 3.
                continue;
            };

            let snapshot = PeerSnapshot {
                peer_id: peer.id,
                timestamp: now,
                rx_bytes: status.rx_bytes,
                tx_bytes: status.tx_bytes,
                online: status.online,
            };
            if let Err(err) = self.store.insert_snapshot(&snapshot) {
                log::error!("poller: failed to write snapshot for peer {}: {err}", peer.id);
                continue;
            }

            self.note_transition(peer.id, status.online, name);
        }
    }

    fn note_transition(&self, peer_id: i64, online: bool, interface: InterfaceName) {
        let mut prev = self.prev_online.lock();
        if let Some(&was_online) = prev.get(&peer_id) {
            if was_online != online {
                if online {
                    log::info!("peer_online peer_id={peer_id} interface={interface}");
                } else {
                    log::info!("peer_offline peer_id={peer_id} interface={interface}");
                }
            }
        }
        prev.insert(peer_id, online);
    }
}

#[cfg(test)]
mod tests {
    use std::{io, net::IpAddr, sync::Mutex as StdMutex};

    use meshguard_control::{
        AllowedIp, Device, DeviceUpdate, KeyPair, LinkController, PeerConfig, PeerInfo, PeerStats,
        WgController,
    };

    use super::*;
    use crate::{model::NetworkMode, store::InMemoryStore};

    #[derive(Default)]
    struct FakeLink;
    impl LinkController for FakeLink {
        fn create_interface(&self, _name: &InterfaceName) -> io::Result<()> {
            Ok(())
        }
        fn delete_interface(&self, _name: &InterfaceName) -> io::Result<()> {
            Ok(())
        }
        fn set_up(&self, _name: &InterfaceName) -> io::Result<()> {
            Ok(())
        }
        fn set_down(&self, _name: &InterfaceName) -> io::Result<()> {
            Ok(())
        }
        fn add_address(&self, _name: &InterfaceName, _address: &AllowedIp) -> io::Result<()> {
            Ok(())
        }
        fn list_addresses(&self, _name: &InterfaceName) -> io::Result<Vec<AllowedIp>> {
            Ok(vec![])
        }
        fn exists(&self, _name: &InterfaceName) -> io::Result<bool> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct FakeWg {
        device: StdMutex<Option<Device>>,
    }
    impl WgController for FakeWg {
        fn configure_device(&self, _name: &InterfaceName, _update: &DeviceUpdate) -> io::Result<()> {
            Ok(())
        }
        fn device(&self, name: &InterfaceName) -> io::Result<Device> {
            self.device
                .lock()
                .unwrap()
                .clone()
                .filter(|d| d.name == *name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no device"))
        }
        fn devices(&self) -> io::Result<Vec<InterfaceName>> {
            Ok(self.device.lock().unwrap().iter().map(|d| d.name).collect())
        }
    }

    fn sample_network(iface: &str) -> Network {
        let keypair = KeyPair::generate();
        Network {
            id: 1,
            name: "home".into(),
            interface_name: iface.parse().unwrap(),
            mode: NetworkMode::Gateway,
            subnet: "10.0.0.0/24".parse().unwrap(),
            listen_port: 51820,
            private_key: keypair.private,
            public_key: keypair.public,
            dns_servers: String::new(),
            nat_enabled: true,
            inter_peer_routing: true,
            enabled: true,
        }
    }

    #[test]
    fn test_poll_once_writes_snapshot_for_known_peer() {
        let iface: InterfaceName = "wg0".parse().unwrap();
        let peer_key = KeyPair::generate().public;
        let device = Device {
            name: iface,
            public_key: None,
            private_key: None,
            fwmark: None,
            listen_port: Some(51820),
            peers: vec![PeerInfo {
                config: PeerConfig {
                    public_key: peer_key.clone(),
                    preshared_key: None,
                    endpoint: None,
                    persistent_keepalive_interval: None,
                    allowed_ips: vec![AllowedIp {
                        address: "10.0.0.2".parse::<IpAddr>().unwrap(),
                        cidr: 32,
                    }],
                },
                stats: PeerStats {
                    last_handshake_time: Some(SystemTime::now()),
                    rx_bytes: 111,
                    tx_bytes: 222,
                },
            }],
        };
        let wg = Arc::new(FakeWg {
            device: StdMutex::new(Some(device)),
        });
        let lifecycle = Arc::new(LifecycleManager::new(Arc::new(FakeLink), wg));
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let network = store.create_network(sample_network("wg0")).unwrap();
        let peer = store
            .create_peer(Peer {
                id: 0,
                network_id: network.id,
                name: "laptop".into(),
                public_key: peer_key,
                private_key: None,
                preshared_key: None,
                allowed_ips: "10.0.0.2/32".into(),
                endpoint: None,
                persistent_keepalive: 25,
                role: "client".into(),
                site_networks: String::new(),
                enabled: true,
                expires_at: None,
            })
            .unwrap();

        let poller = Poller::new(store.clone(), lifecycle);
        poller.poll_once();

        let now = SystemTime::now();
        let snapshots = store
            .list_snapshots(peer.id, now - std::time::Duration::from_secs(5), now + std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].rx_bytes, 111);
        assert_eq!(snapshots[0].tx_bytes, 222);
    }

    #[test]
    fn test_poll_once_drops_unknown_kernel_peer_silently() {
        let iface: InterfaceName = "wg0".parse().unwrap();
        let device = Device {
            name: iface,
            public_key: None,
            private_key: None,
            fwmark: None,
            listen_port: Some(51820),
            peers: vec![PeerInfo {
                config: PeerConfig {
                    public_key: KeyPair::generate().public,
                    preshared_key: None,
                    endpoint: None,
                    persistent_keepalive_interval: None,
                    allowed_ips: vec![],
                },
                stats: PeerStats::default(),
            }],
        };
        let wg = Arc::new(FakeWg {
            device: StdMutex::new(Some(device)),
        });
        let lifecycle = Arc::new(LifecycleManager::new(Arc::new(FakeLink), wg));
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.create_network(sample_network("wg0")).unwrap();

        let poller = Poller::new(store, lifecycle);
        poller.poll_once(); // must not panic despite the unmatched kernel peer
    }
}
