use std::{
    collections::HashSet,
    net::SocketAddr,
    time::{Duration, SystemTime},
};

use ipnet::IpNet;
use meshguard_control::{AllowedIp, InterfaceName, Key};

/// Default keepalive interval applied to peers that don't specify one,
/// matching the value `wg-quick` uses.
pub const DEFAULT_PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// A peer is considered online if its last handshake happened within this
/// window.
pub const HANDSHAKE_ONLINE_WINDOW: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Gateway,
    Bridge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub id: i64,
    pub name: String,
    pub interface_name: InterfaceName,
    pub mode: NetworkMode,
    pub subnet: IpNet,
    pub listen_port: u16,
    pub private_key: Key,
    pub public_key: Key,
    pub dns_servers: String,
    pub nat_enabled: bool,
    pub inter_peer_routing: bool,
    pub enabled: bool,
}

impl Network {
    /// The first usable host address in the subnet, reserved for the
    /// network's own interface.
    pub fn server_ip(&self) -> std::net::IpAddr {
        self.subnet
            .hosts()
            .next()
            .expect("subnet has at least two usable host addresses")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDirection {
    AToB,
    BToA,
    Bidirectional,
}

impl BridgeDirection {
    pub fn to_netfilter(self, a: InterfaceName, b: InterfaceName) -> (InterfaceName, InterfaceName, meshguard_netfilter::BridgeDirection) {
        match self {
            BridgeDirection::AToB => (a, b, meshguard_netfilter::BridgeDirection::OneWay),
            BridgeDirection::BToA => (b, a, meshguard_netfilter::BridgeDirection::OneWay),
            BridgeDirection::Bidirectional => {
                (a, b, meshguard_netfilter::BridgeDirection::Bidirectional)
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: i64,
    pub network_id: i64,
    pub name: String,
    pub public_key: Key,
    pub private_key: Option<Key>,
    pub preshared_key: Option<Key>,
    pub allowed_ips: String,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: u16,
    pub role: String,
    pub site_networks: String,
    pub enabled: bool,
    pub expires_at: Option<SystemTime>,
}

impl Peer {
    /// Parses `allowed_ips` into the wire-level type the WG controller
    /// expects, silently skipping entries that fail to parse as
    /// `address/cidr` (malformed rows shouldn't be able to reach the store,
    /// but a defensive parse here keeps a bad row from wedging a whole
    /// reconcile pass).
    pub fn parsed_allowed_ips(&self) -> Vec<AllowedIp> {
        self.allowed_ips
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// The allowed-IP set as a normalized, order-independent set of CIDR
    /// strings, for comparing drift between the database and the kernel.
    pub fn normalized_allowed_ip_set(&self) -> HashSet<String> {
        self.parsed_allowed_ips()
            .iter()
            .map(|ip| format!("{}/{}", ip.address, ip.cidr))
            .collect()
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub id: i64,
    pub interface_a: InterfaceName,
    pub interface_b: InterfaceName,
    pub direction: BridgeDirection,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerSnapshot {
    pub peer_id: i64,
    pub timestamp: SystemTime,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub online: bool,
}

/// A peer's live status as read off the kernel, combined with the fields
/// the lifecycle manager's `PeerStatus` operation promises.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatusEntry {
    pub public_key: Key,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub allowed_ips: Vec<AllowedIp>,
    pub online: bool,
}

impl PeerStatusEntry {
    pub fn compute_online(last_handshake: Option<SystemTime>, now: SystemTime) -> bool {
        match last_handshake {
            Some(at) => match now.duration_since(at) {
                Ok(elapsed) => elapsed <= HANDSHAKE_ONLINE_WINDOW,
                Err(_) => true, // clock skew placed `at` in the future; treat as fresh
            },
            None => false,
        }
    }
}
