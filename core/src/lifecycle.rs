use std::{sync::Arc, time::SystemTime};

use meshguard_control::{
    AllowedIp, DeviceUpdate, InterfaceName, Key, LinkController, PeerConfigBuilder, WgController,
};
use parking_lot::Mutex;

use crate::{
    error::CoreError,
    model::{Network, Peer, PeerStatusEntry},
};

/// Serializes every kernel-facing mutation through a single exclusion lock.
/// Callers may invoke any combination of operations concurrently; this
/// manager makes their execution order equal to their arrival order.
///
/// The reconciler needs to hold this same lock across an entire pass rather
/// than once per operation, so the public methods are thin wrappers around
/// `*_locked` variants the reconciler calls directly after taking the lock
/// itself via [`LifecycleManager::lock`].
pub struct LifecycleManager {
    link: Arc<dyn LinkController>,
    wg: Arc<dyn WgController>,
    lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(link: Arc<dyn LinkController>, wg: Arc<dyn WgController>) -> Self {
        Self {
            link,
            wg,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Lists every WireGuard interface currently present on the host.
    /// Callers holding the lock (the reconciler) use this to find out which
    /// networks the kernel already has before deciding what to create.
    pub(crate) fn devices_locked(&self) -> Result<Vec<InterfaceName>, CoreError> {
        Ok(self.wg.devices()?)
    }

    /// Reads back the full current state of one interface.
    pub(crate) fn device_locked(&self, name: &InterfaceName) -> Result<meshguard_control::Device, CoreError> {
        Ok(self.wg.device(name)?)
    }

    pub fn create_interface(&self, network: &Network) -> Result<(), CoreError> {
        let _guard = self.lock();
        self.create_interface_locked(network)
    }

    pub(crate) fn create_interface_locked(&self, network: &Network) -> Result<(), CoreError> {
        let name = network.interface_name;

        self.link.create_interface(&name)?;

        let server_ip = network.server_ip();
        let address = AllowedIp {
            address: server_ip,
            cidr: network.subnet.prefix_len(),
        };

        if let Err(err) = self.link.add_address(&name, &address) {
            let _ = self.link.delete_interface(&name);
            return Err(err.into());
        }

        let update = DeviceUpdate::new()
            .set_private_key(network.private_key.clone())
            .set_listen_port(network.listen_port);
        if let Err(err) = self.wg.configure_device(&name, &update) {
            let _ = self.link.delete_interface(&name);
            return Err(err.into());
        }

        if let Err(err) = self.link.set_up(&name) {
            let _ = self.link.delete_interface(&name);
            return Err(err.into());
        }

        Ok(())
    }

    pub fn delete_interface(&self, name: &InterfaceName) -> Result<(), CoreError> {
        let _guard = self.lock();
        self.delete_interface_locked(name)
    }

    pub(crate) fn delete_interface_locked(&self, name: &InterfaceName) -> Result<(), CoreError> {
        let device = self.wg.device(name)?;
        let keys: Vec<Key> = device.peers.iter().map(|p| p.config.public_key.clone()).collect();

        if !keys.is_empty() {
            let mut update = DeviceUpdate::new();
            for key in &keys {
                update = update.remove_peer_by_key(key);
            }
            self.wg.configure_device(name, &update)?;
        }

        self.link.set_down(name)?;
        self.link.delete_interface(name)?;
        Ok(())
    }

    pub fn add_peer(&self, iface: &InterfaceName, peer: &Peer) -> Result<(), CoreError> {
        let _guard = self.lock();
        self.add_peer_locked(iface, peer)
    }

    pub(crate) fn add_peer_locked(&self, iface: &InterfaceName, peer: &Peer) -> Result<(), CoreError> {
        let builder = peer_config_builder(peer).replace_allowed_ips();
        self.wg.configure_device(iface, &DeviceUpdate::new().add_peer(builder))?;
        Ok(())
    }

    pub fn update_peer(&self, iface: &InterfaceName, peer: &Peer) -> Result<(), CoreError> {
        let _guard = self.lock();
        self.update_peer_locked(iface, peer)
    }

    pub(crate) fn update_peer_locked(&self, iface: &InterfaceName, peer: &Peer) -> Result<(), CoreError> {
        let builder = peer_config_builder(peer).replace_allowed_ips().update_only();
        self.wg.configure_device(iface, &DeviceUpdate::new().add_peer(builder))?;
        Ok(())
    }

    pub fn remove_peer(&self, iface: &InterfaceName, public_key: &Key) -> Result<(), CoreError> {
        let _guard = self.lock();
        self.remove_peer_locked(iface, public_key)
    }

    pub(crate) fn remove_peer_locked(
        &self,
        iface: &InterfaceName,
        public_key: &Key,
    ) -> Result<(), CoreError> {
        self.wg
            .configure_device(iface, &DeviceUpdate::new().remove_peer_by_key(public_key))?;
        Ok(())
    }

    pub fn peer_status(&self, iface: &InterfaceName) -> Result<Vec<PeerStatusEntry>, CoreError> {
        let _guard = self.lock();
        self.peer_status_locked(iface)
    }

    pub(crate) fn peer_status_locked(&self, iface: &InterfaceName) -> Result<Vec<PeerStatusEntry>, CoreError> {
        let device = self.wg.device(iface)?;
        let now = SystemTime::now();
        Ok(device
            .peers
            .into_iter()
            .map(|info| {
                let last_handshake = info.stats.last_handshake_time;
                PeerStatusEntry {
                    public_key: info.config.public_key,
                    endpoint: info.config.endpoint,
                    last_handshake,
                    rx_bytes: info.stats.rx_bytes,
                    tx_bytes: info.stats.tx_bytes,
                    allowed_ips: info.config.allowed_ips,
                    online: PeerStatusEntry::compute_online(last_handshake, now),
                }
            })
            .collect())
    }
}

fn peer_config_builder(peer: &Peer) -> PeerConfigBuilder {
    let mut builder = PeerConfigBuilder::new(&peer.public_key).add_allowed_ips(&peer.parsed_allowed_ips());
    if let Some(psk) = &peer.preshared_key {
        builder = builder.set_preshared_key(psk.clone());
    }
    if let Some(endpoint) = peer.endpoint {
        builder = builder.set_endpoint(endpoint);
    }
    if peer.persistent_keepalive > 0 {
        builder = builder.set_persistent_keepalive_interval(peer.persistent_keepalive);
    }
    builder
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        net::IpAddr,
        sync::Mutex as StdMutex,
    };

    use meshguard_control::{Device, KeyPair, PeerConfig, PeerInfo, PeerStats};

    use super::*;
    use crate::model::NetworkMode;

    #[derive(Default)]
    struct FakeLink {
        created: StdMutex<Vec<InterfaceName>>,
        up: StdMutex<Vec<InterfaceName>>,
        fail_create: bool,
    }

    impl LinkController for FakeLink {
        fn create_interface(&self, name: &InterfaceName) -> io::Result<()> {
            if self.fail_create {
                return Err(io::Error::other("boom"));
            }
            self.created.lock().unwrap().push(*name);
            Ok(())
        }
        fn delete_interface(&self, _name: &InterfaceName) -> io::Result<()> {
            Ok(())
        }
        fn set_up(&self, name: &InterfaceName) -> io::Result<()> {
            self.up.lock().unwrap().push(*name);
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
        fn exists(&self, name: &InterfaceName) -> io::Result<bool> {
            Ok(self.created.lock().unwrap().contains(name))
        }
    }

    #[derive(Default)]
    struct FakeWg {
        device: StdMutex<Option<Device>>,
        fail_configure: bool,
    }

    impl WgController for FakeWg {
        fn configure_device(&self, _name: &InterfaceName, _update: &DeviceUpdate) -> io::Result<()> {
            if self.fail_configure {
                return Err(io::Error::other("boom"));
            }
            Ok(())
        }
        fn device(&self, name: &InterfaceName) -> io::Result<Device> {
            self.device
                .lock()
                .unwrap()
                .clone()
                .filter(|d| d.name == *name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such device"))
        }
        fn devices(&self) -> io::Result<Vec<InterfaceName>> {
            Ok(self.device.lock().unwrap().iter().map(|d| d.name).collect())
        }
    }

    fn sample_network() -> Network {
        let keypair = KeyPair::generate();
        Network {
            id: 1,
            name: "home".into(),
            interface_name: "wg0".parse().unwrap(),
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
    fn test_create_interface_brings_link_up() {
        let link = Arc::new(FakeLink::default());
        let wg = Arc::new(FakeWg::default());
        let manager = LifecycleManager::new(link.clone(), wg);

        manager.create_interface(&sample_network()).unwrap();

        assert_eq!(link.up.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_create_interface_rolls_back_link_on_configure_failure() {
        let link = Arc::new(FakeLink::default());
        let wg = Arc::new(FakeWg {
            fail_configure: true,
            ..Default::default()
        });
        let manager = LifecycleManager::new(link.clone(), wg);

        let result = manager.create_interface(&sample_network());

        assert!(result.is_err());
        assert!(link.up.lock().unwrap().is_empty());
    }

    #[test]
    fn test_peer_status_marks_recent_handshake_online() {
        let link = Arc::new(FakeLink::default());
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
                    rx_bytes: 100,
                    tx_bytes: 200,
                },
            }],
        };
        let wg = Arc::new(FakeWg {
            device: StdMutex::new(Some(device)),
            ..Default::default()
        });
        let manager = LifecycleManager::new(link, wg);

        let statuses = manager.peer_status(&iface).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].public_key, peer_key);
        assert!(statuses[0].online);
    }
}
