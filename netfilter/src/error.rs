use thiserror::Error;

/// Failure applying a firewall rule-set transaction.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to materialize rule set in the kernel: {0}")]
    Apply(#[from] std::io::Error),
}
