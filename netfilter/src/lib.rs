mod error;
mod manager;
mod nftables;
mod rule;
pub mod wire;

pub use crate::{
    error::FirewallError,
    manager::FirewallManager,
    nftables::{dump_rules, NftablesApplier, RuleSetApplier},
    rule::{bridge_key, BridgeDirection, FirewallRule},
};
