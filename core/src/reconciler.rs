//! Converges kernel state toward the database: the periodic/on-demand
//! reconcile pass (§4.4) and the separate bridge-to-firewall sync.
//!
//! [`reconcile`] holds the lifecycle manager's lock for its entire pass -
//! the reconciler executes as one large serialized block, so no other
//! lifecycle mutation can interleave with it.

use std::collections::{HashMap, HashSet};

use meshguard_control::{InterfaceName, Key};
use meshguard_netfilter::FirewallManager;

use crate::{
    lifecycle::LifecycleManager,
    model::{Bridge, Network},
    store::Store,
};

/// One diff-and-apply pass from `store` into the kernel. Partial failures
/// are logged and do not abort the pass - the next pass retries.
pub fn reconcile(lifecycle: &LifecycleManager, store: &dyn Store) {
    let _guard = lifecycle.lock();

    let networks = match store.list_networks() {
        Ok(networks) => networks,
        Err(err) => {
            log::error!("reconcile: failed to list networks from store: {err}");
            return;
        },
    };

    let kernel_interfaces: HashSet<InterfaceName> = match lifecycle.devices_locked() {
        Ok(names) => names.into_iter().collect(),
        Err(err) => {
            log::error!("reconcile: failed to list kernel devices: {err}");
            return;
        },
    };

    for network in &networks {
        reconcile_network(lifecycle, store, network, &kernel_interfaces);
    }

    for interface in &kernel_interfaces {
        if !networks.iter().any(|n| n.interface_name == *interface) {
            log::debug!(
                "reconcile: kernel interface {interface} is orphaned (no matching network in the store), leaving it alone"
            );
        }
    }
}

fn reconcile_network(
    lifecycle: &LifecycleManager,
    store: &dyn Store,
    network: &Network,
    kernel_interfaces: &HashSet<InterfaceName>,
) {
    let name = network.interface_name;
    let exists = kernel_interfaces.contains(&name);

    if !network.enabled {
        if exists {
            log::info!("reconcile: network {} ({name}) is disabled, tearing down interface", network.name);
            if let Err(err) = lifecycle.delete_interface_locked(&name) {
                log::error!("reconcile: failed to tear down {name}: {err}");
            }
        }
        return;
    }

    if !exists {
        log::info!("reconcile: network {} ({name}) is enabled, creating interface", network.name);
        if let Err(err) = lifecycle.create_interface_locked(network) {
            log::error!("reconcile: failed to create interface {name}: {err}");
        }
    }

    if let Err(err) = sync_peers(lifecycle, store, network) {
        log::error!("reconcile: failed to sync peers for {name}: {err}");
    }
}

fn sync_peers(
    lifecycle: &LifecycleManager,
    store: &dyn Store,
    network: &Network,
) -> Result<(), crate::error::CoreError> {
    let name = network.interface_name;
    let db_peers = store.list_peers_by_network(network.id)?;
    let device = lifecycle.device_locked(&name)?;

    let mut kernel_peers: HashMap<Key, meshguard_control::PeerInfo> = device
        .peers
        .into_iter()
        .map(|peer| (peer.config.public_key.clone(), peer))
        .collect();

    for peer in &db_peers {
        let kernel_peer = kernel_peers.remove(&peer.public_key);
        match (peer.enabled, kernel_peer) {
            (false, Some(_)) => {
                log::info!("reconcile: removing disabled peer {} from {name}", peer.public_key.to_base64());
                if let Err(err) = lifecycle.remove_peer_locked(&name, &peer.public_key) {
                    log::error!(
                        "reconcile: failed to remove disabled peer {}: {err}",
                        peer.public_key.to_base64()
                    );
                }
            },
            (true, None) => {
                log::info!("reconcile: adding peer {} to {name}", peer.public_key.to_base64());
                if let Err(err) = lifecycle.add_peer_locked(&name, peer) {
                    log::error!("reconcile: failed to add peer {}: {err}", peer.public_key.to_base64());
                }
            },
            (true, Some(existing)) => {
                let kernel_set: HashSet<String> = existing
                    .config
                    .allowed_ips
                    .iter()
                    .map(|ip| format!("{}/{}", ip.address, ip.cidr))
                    .collect();
                if kernel_set != peer.normalized_allowed_ip_set() {
                    log::info!(
                        "reconcile: allowed-IPs drift for peer {} on {name}, updating",
                        peer.public_key.to_base64()
                    );
                    if let Err(err) = lifecycle.update_peer_locked(&name, peer) {
                        log::error!("reconcile: failed to update peer {}: {err}", peer.public_key.to_base64());
                    }
                }
                if let Some(endpoint) = peer.endpoint {
                    if existing.config.endpoint != Some(endpoint) {
                        // Endpoints are client-driven; we never correct drift here.
                        log::debug!(
                            "reconcile: endpoint mismatch for peer {} on {name} (not corrected)",
                            peer.public_key.to_base64()
                        );
                    }
                }
            },
            (false, None) => {},
        }
    }

    for (public_key, _) in kernel_peers {
        log::info!("reconcile: removing orphaned kernel peer {} from {name}", public_key.to_base64());
        if let Err(err) = lifecycle.remove_peer_locked(&name, &public_key) {
            log::error!("reconcile: failed to remove orphaned peer {}: {err}", public_key.to_base64());
        }
    }

    Ok(())
}

/// Syncs the bridge table into the firewall manager: every enabled bridge
/// gets an idempotent add. Disabled bridges are skipped - removal only
/// happens when an operator explicitly deletes the bridge.
pub fn reconcile_bridges<A: meshguard_netfilter::RuleSetApplier>(
    store: &dyn Store,
    firewall: &FirewallManager<A>,
) {
    let bridges = match store.list_bridges() {
        Ok(bridges) => bridges,
        Err(err) => {
            log::error!("reconcile_bridges: failed to list bridges from store: {err}");
            return;
        },
    };

    for bridge in &bridges {
        if !bridge.enabled {
            continue;
        }
        if let Err(err) = apply_bridge(firewall, bridge) {
            log::error!(
                "reconcile_bridges: failed to sync bridge {}<->{}: {err}",
                bridge.interface_a,
                bridge.interface_b
            );
        }
    }
}

fn apply_bridge<A: meshguard_netfilter::RuleSetApplier>(
    firewall: &FirewallManager<A>,
    bridge: &Bridge,
) -> Result<(), meshguard_netfilter::FirewallError> {
    let (a, b, direction) = bridge.direction.to_netfilter(bridge.interface_a, bridge.interface_b);
    firewall.add_network_bridge(&a, &b, direction)
}

/// Runs [`reconcile`] and [`reconcile_bridges`] together on `interval` until
/// `cancel` fires. This is the long-running task an operator's supervisor
/// spawns alongside the poller, compactor and expiry checker.
pub async fn run_periodic<A: meshguard_netfilter::RuleSetApplier + 'static>(
    lifecycle: std::sync::Arc<LifecycleManager>,
    store: std::sync::Arc<dyn Store>,
    firewall: std::sync::Arc<FirewallManager<A>>,
    interval: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("reconciler: cancellation received, exiting");
                return;
            },
            _ = ticker.tick() => {
                reconcile(&lifecycle, store.as_ref());
                reconcile_bridges(store.as_ref(), firewall.as_ref());
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, net::IpAddr, sync::Mutex as StdMutex};

    use meshguard_control::{
        AllowedIp, Device, DeviceUpdate, KeyPair, LinkController, PeerConfig, PeerInfo, PeerStats,
        WgController,
    };
    use meshguard_netfilter::RuleSetApplier;

    use super::*;
    use crate::{
        model::{BridgeDirection, NetworkMode},
        store::InMemoryStore,
    };

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
        devices: StdMutex<HashMap<InterfaceName, Device>>,
    }

    impl FakeWg {
        fn insert_empty(&self, name: InterfaceName) {
            self.devices.lock().unwrap().insert(
                name,
                Device {
                    name,
                    public_key: None,
                    private_key: None,
                    fwmark: None,
                    listen_port: Some(51820),
                    peers: vec![],
                },
            );
        }

        fn insert_peer(&self, name: InterfaceName, public_key: Key, allowed_ips: Vec<AllowedIp>) {
            let mut devices = self.devices.lock().unwrap();
            let device = devices.entry(name).or_insert_with(|| Device {
                name,
                public_key: None,
                private_key: None,
                fwmark: None,
                listen_port: Some(51820),
                peers: vec![],
            });
            device.peers.push(PeerInfo {
                config: PeerConfig {
                    public_key,
                    preshared_key: None,
                    endpoint: None,
                    persistent_keepalive_interval: None,
                    allowed_ips,
                },
                stats: PeerStats::default(),
            });
        }
    }

    impl WgController for FakeWg {
        fn configure_device(&self, name: &InterfaceName, update: &DeviceUpdate) -> io::Result<()> {
            let mut devices = self.devices.lock().unwrap();
            let device = devices.entry(*name).or_insert_with(|| Device {
                name: *name,
                public_key: None,
                private_key: None,
                fwmark: None,
                listen_port: None,
                peers: vec![],
            });
            for peer in update.peers() {
                let key = peer.public_key().clone();
                let existed = device.peers.iter().any(|p| p.config.public_key == key);
                if peer.is_update_only() && !existed {
                    continue;
                }
                device.peers.retain(|p| p.config.public_key != key);
                if !peer.is_remove() {
                    device.peers.push(PeerInfo {
                        config: peer.clone().into_peer_config(),
                        stats: PeerStats::default(),
                    });
                }
            }
            Ok(())
        }

        fn device(&self, name: &InterfaceName) -> io::Result<Device> {
            self.devices
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such device"))
        }

        fn devices(&self) -> io::Result<Vec<InterfaceName>> {
            Ok(self.devices.lock().unwrap().keys().copied().collect())
        }
    }

    fn sample_network(name: &str) -> Network {
        let keypair = KeyPair::generate();
        Network {
            id: 1,
            name: name.into(),
            interface_name: name.parse().unwrap(),
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
    fn test_cold_start_creates_interface() {
        let link = std::sync::Arc::new(FakeLink);
        let wg = std::sync::Arc::new(FakeWg::default());
        let lifecycle = LifecycleManager::new(link, wg.clone());
        let store = InMemoryStore::new();
        store.create_network(sample_network("wg0")).unwrap();

        reconcile(&lifecycle, &store);

        assert!(wg.devices().unwrap().contains(&"wg0".parse().unwrap()));
    }

    #[test]
    fn test_adds_enabled_peer_missing_from_kernel() {
        let link = std::sync::Arc::new(FakeLink);
        let wg = std::sync::Arc::new(FakeWg::default());
        let iface: InterfaceName = "wg0".parse().unwrap();
        wg.insert_empty(iface);
        let lifecycle = LifecycleManager::new(link, wg.clone());
        let store = InMemoryStore::new();
        let network = store.create_network(sample_network("wg0")).unwrap();
        let peer_key = KeyPair::generate().public;
        store
            .create_peer(crate::model::Peer {
                id: 0,
                network_id: network.id,
                name: "laptop".into(),
                public_key: peer_key.clone(),
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

        reconcile(&lifecycle, &store);

        let device = wg.device(&iface).unwrap();
        assert_eq!(device.peers.len(), 1);
        assert_eq!(device.peers[0].config.public_key, peer_key);
    }

    #[test]
    fn test_fixes_drifted_allowed_ips() {
        let link = std::sync::Arc::new(FakeLink);
        let wg = std::sync::Arc::new(FakeWg::default());
        let iface: InterfaceName = "wg0".parse().unwrap();
        wg.insert_empty(iface);
        let lifecycle = LifecycleManager::new(link, wg.clone());
        let store = InMemoryStore::new();
        let network = store.create_network(sample_network("wg0")).unwrap();
        let peer_key = KeyPair::generate().public;
        let peer = store
            .create_peer(crate::model::Peer {
                id: 0,
                network_id: network.id,
                name: "laptop".into(),
                public_key: peer_key.clone(),
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

        reconcile(&lifecycle, &store);
        let device = wg.device(&iface).unwrap();
        assert_eq!(device.peers[0].config.allowed_ips, vec![AllowedIp {
            address: "10.0.0.2".parse::<IpAddr>().unwrap(),
            cidr: 32,
        }]);

        let mut drifted = peer;
        drifted.allowed_ips = "10.0.0.5/32".into();
        store.update_peer(&drifted).unwrap();

        reconcile(&lifecycle, &store);

        let device = wg.device(&iface).unwrap();
        assert_eq!(device.peers.len(), 1);
        assert_eq!(device.peers[0].config.allowed_ips, vec![AllowedIp {
            address: "10.0.0.5".parse::<IpAddr>().unwrap(),
            cidr: 32,
        }]);
    }

    #[test]
    fn test_removes_orphaned_kernel_peer() {
        let link = std::sync::Arc::new(FakeLink);
        let wg = std::sync::Arc::new(FakeWg::default());
        let iface: InterfaceName = "wg0".parse().unwrap();
        wg.insert_empty(iface);
        let orphan_key = KeyPair::generate().public;
        wg.insert_peer(
            iface,
            orphan_key.clone(),
            vec![AllowedIp {
                address: "10.0.0.9".parse::<IpAddr>().unwrap(),
                cidr: 32,
            }],
        );
        let lifecycle = LifecycleManager::new(link, wg.clone());
        let store = InMemoryStore::new();
        store.create_network(sample_network("wg0")).unwrap();

        reconcile(&lifecycle, &store);

        let device = wg.device(&iface).unwrap();
        assert!(!device.peers.iter().any(|p| p.config.public_key == orphan_key));
    }

    #[derive(Default)]
    struct NoopApplier;

    impl RuleSetApplier for NoopApplier {
        fn apply(&self, _rules: &[meshguard_netfilter::FirewallRule]) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_reconcile_bridges_is_idempotent() {
        let firewall = FirewallManager::new(NoopApplier);
        let store = InMemoryStore::new();
        store
            .create_bridge(Bridge {
                id: 0,
                interface_a: "wg-a".parse().unwrap(),
                interface_b: "wg-b".parse().unwrap(),
                direction: BridgeDirection::Bidirectional,
                enabled: true,
            })
            .unwrap();

        reconcile_bridges(&store, &firewall);
        reconcile_bridges(&store, &firewall);

        assert!(firewall.dump_rules().contains("wg-a"));
    }
}
