//! Data model, store, IP allocator, lifecycle manager, reconciler and
//! monitor loops for the meshguard control plane.

pub mod alloc;
pub mod compactor;
pub mod config_import;
pub mod error;
pub mod expiry;
pub mod lifecycle;
pub mod model;
pub mod poller;
pub mod reconciler;
pub mod store;
pub mod task_host;

pub use alloc::IpAllocator;
pub use compactor::Compactor;
pub use error::CoreError;
pub use expiry::ExpiryChecker;
pub use lifecycle::LifecycleManager;
pub use poller::Poller;
pub use reconciler::{reconcile, reconcile_bridges, run_periodic};
pub use store::Store;
pub use task_host::{TaskHost, TaskIntervals};
