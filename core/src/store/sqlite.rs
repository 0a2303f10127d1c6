use std::time::{Duration, SystemTime};

use meshguard_control::{InterfaceName, Key};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    error::CoreError,
    model::{Bridge, BridgeDirection, Network, NetworkMode, Peer, PeerSnapshot},
};

const CREATE_NETWORKS_SQL: &str = "CREATE TABLE IF NOT EXISTS networks (
    id                  INTEGER PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    interface_name      TEXT NOT NULL UNIQUE,
    mode                TEXT NOT NULL,
    subnet              TEXT NOT NULL,
    listen_port         INTEGER NOT NULL,
    private_key         TEXT NOT NULL,
    public_key          TEXT NOT NULL,
    dns_servers         TEXT NOT NULL DEFAULT '',
    nat_enabled         INTEGER NOT NULL DEFAULT 0,
    inter_peer_routing  INTEGER NOT NULL DEFAULT 0,
    enabled             INTEGER NOT NULL DEFAULT 1
)";

const CREATE_PEERS_SQL: &str = "CREATE TABLE IF NOT EXISTS peers (
    id                   INTEGER PRIMARY KEY,
    network_id           INTEGER NOT NULL,
    name                 TEXT NOT NULL,
    public_key           TEXT NOT NULL,
    private_key          TEXT,
    preshared_key        TEXT,
    allowed_ips          TEXT NOT NULL DEFAULT '',
    endpoint             TEXT,
    persistent_keepalive INTEGER NOT NULL DEFAULT 25,
    role                 TEXT NOT NULL DEFAULT '',
    site_networks        TEXT NOT NULL DEFAULT '',
    enabled              INTEGER NOT NULL DEFAULT 1,
    expires_at           INTEGER,
    UNIQUE(network_id, public_key),
    FOREIGN KEY (network_id) REFERENCES networks (id) ON DELETE CASCADE
)";

const CREATE_BRIDGES_SQL: &str = "CREATE TABLE IF NOT EXISTS bridges (
    id           INTEGER PRIMARY KEY,
    interface_a  TEXT NOT NULL,
    interface_b  TEXT NOT NULL,
    direction    TEXT NOT NULL,
    enabled      INTEGER NOT NULL DEFAULT 1
)";

const CREATE_SNAPSHOTS_SQL: &str = "CREATE TABLE IF NOT EXISTS peer_snapshots (
    peer_id    INTEGER NOT NULL,
    timestamp  INTEGER NOT NULL,
    rx_bytes   INTEGER NOT NULL,
    tx_bytes   INTEGER NOT NULL,
    online     INTEGER NOT NULL
)";

const CREATE_SETTINGS_SQL: &str =
    "CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT NOT NULL)";

/// `rusqlite`-backed implementation of [`crate::store::Store`]. Table
/// layout is this crate's own implementation detail, using the same
/// `CREATE TABLE` + row-mapping idiom throughout: prepared statements,
/// `query_row`/`query_map`, one table per model type.
///
/// The connection is opened once and held for the store's lifetime; this
/// makes no attempt to detect a second process reopening the same database
/// file mid-backup. Take backups via sqlite's own online-backup API or from
/// a stopped instance.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, CoreError> {
        conn.execute(CREATE_NETWORKS_SQL, [])?;
        conn.execute(CREATE_PEERS_SQL, [])?;
        conn.execute(CREATE_BRIDGES_SQL, [])?;
        conn.execute(CREATE_SNAPSHOTS_SQL, [])?;
        conn.execute(CREATE_SETTINGS_SQL, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn mode_to_str(mode: NetworkMode) -> &'static str {
    match mode {
        NetworkMode::Gateway => "gateway",
        NetworkMode::Bridge => "bridge",
    }
}

fn mode_from_str(s: &str) -> Result<NetworkMode, CoreError> {
    match s {
        "gateway" => Ok(NetworkMode::Gateway),
        "bridge" => Ok(NetworkMode::Bridge),
        other => Err(CoreError::Validation(format!("unknown network mode {other:?}"))),
    }
}

fn direction_to_str(direction: BridgeDirection) -> &'static str {
    match direction {
        BridgeDirection::AToB => "a_to_b",
        BridgeDirection::BToA => "b_to_a",
        BridgeDirection::Bidirectional => "bidirectional",
    }
}

fn direction_from_str(s: &str) -> Result<BridgeDirection, CoreError> {
    match s {
        "a_to_b" => Ok(BridgeDirection::AToB),
        "b_to_a" => Ok(BridgeDirection::BToA),
        "bidirectional" => Ok(BridgeDirection::Bidirectional),
        other => Err(CoreError::Validation(format!("unknown bridge direction {other:?}"))),
    }
}

fn parse_interface(s: String) -> Result<InterfaceName, CoreError> {
    s.parse()
        .map_err(|_| CoreError::Validation(format!("invalid interface name {s:?}")))
}

fn parse_key(s: String) -> Result<Key, CoreError> {
    Key::from_base64(&s).map_err(|_| CoreError::Validation("invalid base64 key".into()))
}

fn network_from_row(row: &rusqlite::Row) -> rusqlite::Result<Network> {
    let interface_name: String = row.get(2)?;
    let mode: String = row.get(3)?;
    let subnet: String = row.get(4)?;
    let private_key: String = row.get(6)?;
    let public_key: String = row.get(7)?;
    Ok(Network {
        id: row.get(0)?,
        name: row.get(1)?,
        interface_name: parse_interface(interface_name)
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        mode: mode_from_str(&mode).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        subnet: subnet
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        listen_port: row.get::<_, i64>(5)? as u16,
        private_key: parse_key(private_key).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        public_key: parse_key(public_key).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        dns_servers: row.get(8)?,
        nat_enabled: row.get(9)?,
        inter_peer_routing: row.get(10)?,
        enabled: row.get(11)?,
    })
}

fn peer_from_row(row: &rusqlite::Row) -> rusqlite::Result<Peer> {
    let public_key: String = row.get(3)?;
    let private_key: Option<String> = row.get(4)?;
    let preshared_key: Option<String> = row.get(5)?;
    let endpoint: Option<String> = row.get(7)?;
    let expires_at: Option<i64> = row.get(12)?;
    Ok(Peer {
        id: row.get(0)?,
        network_id: row.get(1)?,
        name: row.get(2)?,
        public_key: parse_key(public_key).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        private_key: private_key
            .map(parse_key)
            .transpose()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        preshared_key: preshared_key
            .map(parse_key)
            .transpose()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        allowed_ips: row.get(6)?,
        endpoint: endpoint.and_then(|e| e.parse().ok()),
        persistent_keepalive: row.get::<_, i64>(8)? as u16,
        role: row.get(9)?,
        site_networks: row.get(10)?,
        enabled: row.get(11)?,
        expires_at: expires_at.map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)),
    })
}

fn bridge_from_row(row: &rusqlite::Row) -> rusqlite::Result<Bridge> {
    let interface_a: String = row.get(1)?;
    let interface_b: String = row.get(2)?;
    let direction: String = row.get(3)?;
    Ok(Bridge {
        id: row.get(0)?,
        interface_a: parse_interface(interface_a)
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        interface_b: parse_interface(interface_b)
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        direction: direction_from_str(&direction)
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
        enabled: row.get(4)?,
    })
}

fn unix_secs(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl super::Store for SqliteStore {
    fn list_networks(&self) -> Result<Vec<Network>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, interface_name, mode, subnet, listen_port, private_key, public_key,
                    dns_servers, nat_enabled, inter_peer_routing, enabled FROM networks",
        )?;
        let rows = stmt
            .query_map([], network_from_row)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn get_network(&self, id: i64) -> Result<Network, CoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, interface_name, mode, subnet, listen_port, private_key, public_key,
                    dns_servers, nat_enabled, inter_peer_routing, enabled FROM networks WHERE id = ?1",
            params![id],
            network_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("network {id}")))
    }

    fn create_network(&self, mut network: Network) -> Result<Network, CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO networks (name, interface_name, mode, subnet, listen_port, private_key,
                public_key, dns_servers, nat_enabled, inter_peer_routing, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                network.name,
                network.interface_name.as_str_lossy(),
                mode_to_str(network.mode),
                network.subnet.to_string(),
                network.listen_port as i64,
                network.private_key.to_base64(),
                network.public_key.to_base64(),
                network.dns_servers,
                network.nat_enabled,
                network.inter_peer_routing,
                network.enabled,
            ],
        )?;
        network.id = conn.last_insert_rowid();
        Ok(network)
    }

    fn update_network(&self, network: &Network) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE networks SET name = ?1, listen_port = ?2, dns_servers = ?3,
                nat_enabled = ?4, inter_peer_routing = ?5, enabled = ?6 WHERE id = ?7",
            params![
                network.name,
                network.listen_port as i64,
                network.dns_servers,
                network.nat_enabled,
                network.inter_peer_routing,
                network.enabled,
                network.id,
            ],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound(format!("network {}", network.id)));
        }
        Ok(())
    }

    fn delete_network(&self, id: i64) -> Result<(), CoreError> {
        self.conn.lock().execute("DELETE FROM networks WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_peers_by_network(&self, network_id: i64) -> Result<Vec<Peer>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, network_id, name, public_key, private_key, preshared_key, allowed_ips,
                    endpoint, persistent_keepalive, role, site_networks, enabled, expires_at
             FROM peers WHERE network_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![network_id], peer_from_row)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn get_peer(&self, id: i64) -> Result<Peer, CoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, network_id, name, public_key, private_key, preshared_key, allowed_ips,
                    endpoint, persistent_keepalive, role, site_networks, enabled, expires_at
             FROM peers WHERE id = ?1",
            params![id],
            peer_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("peer {id}")))
    }

    fn create_peer(&self, mut peer: Peer) -> Result<Peer, CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (network_id, name, public_key, private_key, preshared_key,
                allowed_ips, endpoint, persistent_keepalive, role, site_networks, enabled, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                peer.network_id,
                peer.name,
                peer.public_key.to_base64(),
                peer.private_key.as_ref().map(Key::to_base64),
                peer.preshared_key.as_ref().map(Key::to_base64),
                peer.allowed_ips,
                peer.endpoint.map(|e| e.to_string()),
                peer.persistent_keepalive as i64,
                peer.role,
                peer.site_networks,
                peer.enabled,
                peer.expires_at.map(unix_secs),
            ],
        )?;
        peer.id = conn.last_insert_rowid();
        Ok(peer)
    }

    fn update_peer(&self, peer: &Peer) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE peers SET name = ?1, preshared_key = ?2, allowed_ips = ?3, endpoint = ?4,
                persistent_keepalive = ?5, role = ?6, site_networks = ?7, enabled = ?8,
                expires_at = ?9 WHERE id = ?10",
            params![
                peer.name,
                peer.preshared_key.as_ref().map(Key::to_base64),
                peer.allowed_ips,
                peer.endpoint.map(|e| e.to_string()),
                peer.persistent_keepalive as i64,
                peer.role,
                peer.site_networks,
                peer.enabled,
                peer.expires_at.map(unix_secs),
                peer.id,
            ],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound(format!("peer {}", peer.id)));
        }
        Ok(())
    }

    fn delete_peer(&self, id: i64) -> Result<(), CoreError> {
        self.conn.lock().execute("DELETE FROM peers WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_expired_peers(&self, now: SystemTime) -> Result<Vec<Peer>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, network_id, name, public_key, private_key, preshared_key, allowed_ips,
                    endpoint, persistent_keepalive, role, site_networks, enabled, expires_at
             FROM peers WHERE enabled = 1 AND expires_at IS NOT NULL AND expires_at <= ?1",
        )?;
        let rows = stmt
            .query_map(params![unix_secs(now)], peer_from_row)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn list_bridges(&self) -> Result<Vec<Bridge>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT id, interface_a, interface_b, direction, enabled FROM bridges")?;
        let rows = stmt.query_map([], bridge_from_row)?.collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn create_bridge(&self, mut bridge: Bridge) -> Result<Bridge, CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bridges (interface_a, interface_b, direction, enabled) VALUES (?1, ?2, ?3, ?4)",
            params![
                bridge.interface_a.as_str_lossy(),
                bridge.interface_b.as_str_lossy(),
                direction_to_str(bridge.direction),
                bridge.enabled,
            ],
        )?;
        bridge.id = conn.last_insert_rowid();
        Ok(bridge)
    }

    fn delete_bridge(&self, id: i64) -> Result<(), CoreError> {
        self.conn.lock().execute("DELETE FROM bridges WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn insert_snapshot(&self, snapshot: &PeerSnapshot) -> Result<(), CoreError> {
        self.conn.lock().execute(
            "INSERT INTO peer_snapshots (peer_id, timestamp, rx_bytes, tx_bytes, online)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.peer_id,
                unix_secs(snapshot.timestamp),
                snapshot.rx_bytes as i64,
                snapshot.tx_bytes as i64,
                snapshot.online,
            ],
        )?;
        Ok(())
    }

    fn list_snapshots(
        &self,
        peer_id: i64,
        since: SystemTime,
        until: SystemTime,
    ) -> Result<Vec<PeerSnapshot>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT peer_id, timestamp, rx_bytes, tx_bytes, online FROM peer_snapshots
             WHERE peer_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 ORDER BY timestamp",
        )?;
        let rows = stmt
            .query_map(params![peer_id, unix_secs(since), unix_secs(until)], |row| {
                Ok(PeerSnapshot {
                    peer_id: row.get(0)?,
                    timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(row.get::<_, i64>(1)? as u64),
                    rx_bytes: row.get::<_, i64>(2)? as u64,
                    tx_bytes: row.get::<_, i64>(3)? as u64,
                    online: row.get(4)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn compact_snapshots(&self, cutoff: SystemTime) -> Result<usize, CoreError> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM peer_snapshots WHERE timestamp < ?1",
            params![unix_secs(cutoff)],
        )?;
        Ok(deleted)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .conn
            .lock()
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.conn.lock().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use meshguard_control::KeyPair;

    use super::*;
    use crate::store::Store;

    fn sample_network() -> Network {
        let keypair = KeyPair::generate();
        Network {
            id: 0,
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
    fn test_create_and_get_network_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.create_network(sample_network()).unwrap();
        let fetched = store.get_network(created.id).unwrap();
        assert_eq!(created, fetched);
    }

    #[test]
    fn test_create_and_list_peers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let network = store.create_network(sample_network()).unwrap();
        let peer = Peer {
            id: 0,
            network_id: network.id,
            name: "laptop".into(),
            public_key: KeyPair::generate().public,
            private_key: None,
            preshared_key: None,
            allowed_ips: "10.0.0.2/32".into(),
            endpoint: None,
            persistent_keepalive: 25,
            role: "client".into(),
            site_networks: String::new(),
            enabled: true,
            expires_at: None,
        };
        store.create_peer(peer).unwrap();
        let peers = store.list_peers_by_network(network.id).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].allowed_ips, "10.0.0.2/32");
    }

    #[test]
    fn test_compact_snapshots_drops_only_old_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = SystemTime::now();
        for i in 0..5u64 {
            store
                .insert_snapshot(&PeerSnapshot {
                    peer_id: 1,
                    timestamp: now - Duration::from_secs(48 * 3600) + Duration::from_secs(i * 60),
                    rx_bytes: 0,
                    tx_bytes: 0,
                    online: true,
                })
                .unwrap();
        }
        for i in 0..3u64 {
            store
                .insert_snapshot(&PeerSnapshot {
                    peer_id: 1,
                    timestamp: now + Duration::from_secs(i * 60),
                    rx_bytes: 0,
                    tx_bytes: 0,
                    online: true,
                })
                .unwrap();
        }
        let deleted = store.compact_snapshots(now - Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(deleted, 5);
        let remaining = store
            .list_snapshots(1, now - Duration::from_secs(3600), now + Duration::from_secs(3600))
            .unwrap();
        assert_eq!(remaining.len(), 3);
    }

    #[test]
    fn test_settings_round_trip_and_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get_setting("retention_days").unwrap(), None);
        store.set_setting("retention_days", "30").unwrap();
        store.set_setting("retention_days", "45").unwrap();
        assert_eq!(store.get_setting("retention_days").unwrap(), Some("45".into()));
    }
}
