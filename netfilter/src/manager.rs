use std::collections::HashMap;

use meshguard_control::InterfaceName;
use parking_lot::Mutex;

use crate::{
    error::FirewallError,
    nftables::{dump_rules, RuleSetApplier},
    rule::{bridge_key, BridgeDirection, FirewallRule},
};

/// Owns the full set of firewall rules this system is responsible for and
/// keeps the kernel in sync with it.
///
/// Every mutation takes the same shape: lock, compute the rule's canonical
/// key, check whether the requested state is already in effect (idempotent
/// no-op if so), tentatively mutate the in-memory map, hand the *entire*
/// rule set to the applier, and roll the mutation back if the applier
/// fails. The in-memory map and the kernel are never left disagreeing with
/// each other after a call returns, whichever way it returns.
pub struct FirewallManager<A: RuleSetApplier> {
    applier: A,
    rules: Mutex<HashMap<String, FirewallRule>>,
}

impl<A: RuleSetApplier> FirewallManager<A> {
    pub fn new(applier: A) -> Self {
        Self {
            applier,
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Masquerade outbound traffic leaving `interface`.
    pub fn add_nat_masquerade(&self, interface: &InterfaceName) -> Result<(), FirewallError> {
        let rule = FirewallRule::NatMasquerade {
            interface: *interface,
        };
        self.insert(rule)
    }

    pub fn remove_nat_masquerade(&self, interface: &InterfaceName) -> Result<(), FirewallError> {
        self.remove(&format!("nat:{}", interface))
    }

    /// Accept forwarded traffic between peers on `interface`.
    pub fn enable_inter_peer_forwarding(
        &self,
        interface: &InterfaceName,
    ) -> Result<(), FirewallError> {
        let rule = FirewallRule::InterPeerForward {
            interface: *interface,
        };
        self.insert(rule)
    }

    pub fn disable_inter_peer_forwarding(
        &self,
        interface: &InterfaceName,
    ) -> Result<(), FirewallError> {
        self.remove(&format!("forward:{}", interface))
    }

    pub fn add_network_bridge(
        &self,
        a: &InterfaceName,
        b: &InterfaceName,
        direction: BridgeDirection,
    ) -> Result<(), FirewallError> {
        let rule = FirewallRule::NetworkBridge {
            a: *a,
            b: *b,
            direction,
        };
        self.insert(rule)
    }

    pub fn remove_network_bridge(
        &self,
        a: &InterfaceName,
        b: &InterfaceName,
    ) -> Result<(), FirewallError> {
        self.remove(&bridge_key(a, b))
    }

    /// A deterministic, human-readable rendering of the rules currently in
    /// effect, independent of the order they were added in.
    pub fn dump_rules(&self) -> String {
        let rules = self.rules.lock();
        let current: Vec<FirewallRule> = rules.values().cloned().collect();
        dump_rules(&current)
    }

    fn insert(&self, rule: FirewallRule) -> Result<(), FirewallError> {
        let mut rules = self.rules.lock();
        let key = rule.key();
        if rules.get(&key) == Some(&rule) {
            return Ok(());
        }

        let previous = rules.insert(key.clone(), rule);
        let snapshot: Vec<FirewallRule> = rules.values().cloned().collect();
        if let Err(err) = self.applier.apply(&snapshot) {
            match previous {
                Some(prev) => {
                    rules.insert(key, prev);
                },
                None => {
                    rules.remove(&key);
                },
            }
            return Err(FirewallError::Apply(err));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FirewallError> {
        let mut rules = self.rules.lock();
        let Some(removed) = rules.remove(key) else {
            return Ok(());
        };

        let snapshot: Vec<FirewallRule> = rules.values().cloned().collect();
        if let Err(err) = self.applier.apply(&snapshot) {
            rules.insert(key.to_string(), removed);
            return Err(FirewallError::Apply(err));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::atomic::{AtomicUsize, Ordering}};

    use super::*;

    #[derive(Default)]
    struct CountingApplier {
        calls: AtomicUsize,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl RuleSetApplier for &CountingApplier {
        fn apply(&self, _rules: &[FirewallRule]) -> io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(io::Error::other("applier failed"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_add_nat_masquerade_is_idempotent() {
        let applier = CountingApplier::default();
        let manager = FirewallManager::new(&applier);
        let iface: InterfaceName = "wg0".parse().unwrap();

        manager.add_nat_masquerade(&iface).unwrap();
        manager.add_nat_masquerade(&iface).unwrap();

        assert_eq!(applier.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_unknown_rule_is_a_no_op() {
        let applier = CountingApplier::default();
        let manager = FirewallManager::new(&applier);
        let iface: InterfaceName = "wg0".parse().unwrap();

        manager.remove_nat_masquerade(&iface).unwrap();

        assert_eq!(applier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bridge_add_remove_order_independent() {
        let applier = CountingApplier::default();
        let manager = FirewallManager::new(&applier);
        let a: InterfaceName = "wg-a".parse().unwrap();
        let b: InterfaceName = "wg-b".parse().unwrap();

        manager
            .add_network_bridge(&a, &b, BridgeDirection::Bidirectional)
            .unwrap();
        manager.remove_network_bridge(&b, &a).unwrap();

        assert_eq!(manager.dump_rules(), "");
    }

    #[test]
    fn test_failed_apply_rolls_back_state() {
        let applier = CountingApplier::default();
        let manager = FirewallManager::new(&applier);
        let iface: InterfaceName = "wg0".parse().unwrap();

        applier.fail_next.store(true, Ordering::SeqCst);
        let result = manager.add_nat_masquerade(&iface);

        assert!(result.is_err());
        assert_eq!(manager.dump_rules(), "");
    }

    #[test]
    fn test_failed_remove_restores_previous_rule() {
        let applier = CountingApplier::default();
        let manager = FirewallManager::new(&applier);
        let iface: InterfaceName = "wg0".parse().unwrap();

        manager.add_nat_masquerade(&iface).unwrap();
        applier.fail_next.store(true, Ordering::SeqCst);
        let result = manager.remove_nat_masquerade(&iface);

        assert!(result.is_err());
        assert_eq!(manager.dump_rules(), "nat masquerade oif wg0");
    }
}
