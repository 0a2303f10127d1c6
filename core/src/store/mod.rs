mod memory;
mod sqlite;

use std::time::SystemTime;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::{
    error::CoreError,
    model::{Bridge, Network, Peer, PeerSnapshot},
};

/// The control plane's single source of truth. The lifecycle manager,
/// reconciler and monitor loops are all written against this trait so they
/// can be driven in tests by [`InMemoryStore`] instead of a real database.
///
/// Assumed ACID within a single call; nothing here relies on cross-call
/// transactions.
pub trait Store: Send + Sync {
    fn list_networks(&self) -> Result<Vec<Network>, CoreError>;
    fn get_network(&self, id: i64) -> Result<Network, CoreError>;
    fn create_network(&self, network: Network) -> Result<Network, CoreError>;
    fn update_network(&self, network: &Network) -> Result<(), CoreError>;
    fn delete_network(&self, id: i64) -> Result<(), CoreError>;

    fn list_peers_by_network(&self, network_id: i64) -> Result<Vec<Peer>, CoreError>;
    fn get_peer(&self, id: i64) -> Result<Peer, CoreError>;
    fn create_peer(&self, peer: Peer) -> Result<Peer, CoreError>;
    fn update_peer(&self, peer: &Peer) -> Result<(), CoreError>;
    fn delete_peer(&self, id: i64) -> Result<(), CoreError>;
    fn list_expired_peers(&self, now: SystemTime) -> Result<Vec<Peer>, CoreError>;

    fn list_bridges(&self) -> Result<Vec<Bridge>, CoreError>;
    fn create_bridge(&self, bridge: Bridge) -> Result<Bridge, CoreError>;
    fn delete_bridge(&self, id: i64) -> Result<(), CoreError>;

    fn insert_snapshot(&self, snapshot: &PeerSnapshot) -> Result<(), CoreError>;
    fn list_snapshots(
        &self,
        peer_id: i64,
        since: SystemTime,
        until: SystemTime,
    ) -> Result<Vec<PeerSnapshot>, CoreError>;
    fn compact_snapshots(&self, cutoff: SystemTime) -> Result<usize, CoreError>;

    fn get_setting(&self, key: &str) -> Result<Option<String>, CoreError>;
    fn set_setting(&self, key: &str, value: &str) -> Result<(), CoreError>;
}
