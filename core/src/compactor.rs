//! Periodically deletes peer snapshots older than the retention horizon
//! (§4.7).

use std::{sync::Arc, time::{Duration, SystemTime}};

use tokio_util::sync::CancellationToken;

use crate::store::Store;

pub struct Compactor {
    store: Arc<dyn Store>,
    retention: Duration,
}

impl Compactor {
    pub fn new(store: Arc<dyn Store>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("compactor: cancellation received, exiting");
                    return;
                },
                _ = ticker.tick() => {
                    self.compact_once();
                },
            }
        }
    }

    /// Deletes every snapshot with `timestamp < now - retention`. Failures
    /// are logged, never fatal; the next tick retries.
    pub fn compact_once(&self) {
        let cutoff = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        match self.store.compact_snapshots(cutoff) {
            Ok(deleted) => log::info!("compactor: deleted {deleted} snapshot rows older than {cutoff:?}"),
            Err(err) => log::error!("compactor: failed to compact snapshots: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::PeerSnapshot, store::InMemoryStore};

    #[test]
    fn test_compact_once_drops_exactly_old_rows() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
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

        let compactor = Compactor::new(store.clone(), Duration::from_secs(24 * 3600));
        compactor.compact_once();

        let remaining = store
            .list_snapshots(1, now - Duration::from_secs(3600), now + Duration::from_secs(3600))
            .unwrap();
        assert_eq!(remaining.len(), 3);
    }
}
