//! Owns the four long-running background tasks (reconcile, poll, compact,
//! expiry) the way `server/src/lib.rs`'s `spawn_endpoint_refresher` /
//! `spawn_expired_invite_sweeper` / `spawn_hostfile_writer` helpers own
//! theirs: one struct builds each task's collaborators, spawns it with
//! `tokio::task::spawn`, and keeps the `JoinHandle` so a root
//! `CancellationToken` can signal every loop to stop before the process
//! waits on them.

use std::{sync::Arc, time::Duration};

use meshguard_netfilter::{FirewallManager, RuleSetApplier};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{compactor::Compactor, expiry::ExpiryChecker, lifecycle::LifecycleManager, poller::Poller, reconciler, store::Store};

/// The default snapshot retention horizon (§3's peer snapshot entity, §6).
pub const DEFAULT_SNAPSHOT_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Tick intervals for each background loop, defaulting to the durations
/// §6 names: a 30s poll interval, a 1h compaction interval and a 1h expiry
/// check interval. Reconcile has no spec-mandated default; 10s matches the
/// poll loop's general cadence closely enough to catch drift quickly
/// without hammering the kernel.
pub struct TaskIntervals {
    pub reconcile: Duration,
    pub poll: Duration,
    pub compact: Duration,
    pub expiry: Duration,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            reconcile: Duration::from_secs(10),
            poll: Duration::from_secs(30),
            compact: Duration::from_secs(3600),
            expiry: Duration::from_secs(3600),
        }
    }
}

/// Spawns and owns the background task set for one running instance of the
/// control plane. Call [`TaskHost::shutdown`] to stop all four loops and
/// wait for them to exit; dropping a `TaskHost` without calling it leaves
/// the tasks running detached.
pub struct TaskHost {
    cancel: CancellationToken,
    reconcile: JoinHandle<()>,
    poll: JoinHandle<()>,
    compact: JoinHandle<()>,
    expiry: JoinHandle<()>,
}

impl TaskHost {
    pub fn spawn<A>(
        lifecycle: Arc<LifecycleManager>,
        store: Arc<dyn Store>,
        firewall: Arc<FirewallManager<A>>,
        snapshot_retention: Duration,
        intervals: TaskIntervals,
    ) -> Self
    where
        A: RuleSetApplier + 'static,
    {
        let cancel = CancellationToken::new();

        let reconcile = tokio::task::spawn(reconciler::run_periodic(
            lifecycle.clone(),
            store.clone(),
            firewall,
            intervals.reconcile,
            cancel.clone(),
        ));

        let poller = Arc::new(Poller::new(store.clone(), lifecycle.clone()));
        let poll = tokio::task::spawn(poller.run(intervals.poll, cancel.clone()));

        let compactor = Arc::new(Compactor::new(store.clone(), snapshot_retention));
        let compact = tokio::task::spawn(compactor.run(intervals.compact, cancel.clone()));

        let expiry_checker = Arc::new(ExpiryChecker::new(store, lifecycle));
        let expiry = tokio::task::spawn(expiry_checker.run(intervals.expiry, cancel.clone()));

        Self {
            cancel,
            reconcile,
            poll,
            compact,
            expiry,
        }
    }

    /// Signals every loop to stop and waits for all four to exit. Join
    /// errors (a task panic) are logged, not propagated - shutdown always
    /// completes.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.reconcile.await {
            log::error!("task host: reconcile task did not exit cleanly: {err}");
        }
        if let Err(err) = self.poll.await {
            log::error!("task host: poll task did not exit cleanly: {err}");
        }
        if let Err(err) = self.compact.await {
            log::error!("task host: compact task did not exit cleanly: {err}");
        }
        if let Err(err) = self.expiry.await {
            log::error!("task host: expiry task did not exit cleanly: {err}");
        }
    }
}
