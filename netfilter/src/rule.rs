use meshguard_control::InterfaceName;

/// Direction a bridge rule forwards traffic in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDirection {
    /// Only `a -> b` is accepted.
    OneWay,
    /// Both `a -> b` and `b -> a` are accepted.
    Bidirectional,
}

/// A single firewall rule this system owns, keyed canonically so that adds
/// and removes of logically-equivalent rules collide on the same entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallRule {
    /// Masquerade outbound traffic leaving `interface` (NAT).
    NatMasquerade { interface: InterfaceName },
    /// Accept forwarded traffic where both input and output interface are
    /// the WireGuard interface, i.e. peer-to-peer forwarding.
    InterPeerForward { interface: InterfaceName },
    /// Accept forwarded traffic between two bridged interfaces.
    NetworkBridge {
        a: InterfaceName,
        b: InterfaceName,
        direction: BridgeDirection,
    },
}

impl FirewallRule {
    /// The canonical key this rule is stored and looked up under. Bridge
    /// rules order their two interface names lexicographically so that
    /// `AddNetworkBridge(a, b)` and `RemoveNetworkBridge(b, a)` address the
    /// same entry regardless of argument order.
    pub fn key(&self) -> String {
        match self {
            FirewallRule::NatMasquerade { interface } => format!("nat:{}", interface),
            FirewallRule::InterPeerForward { interface } => format!("forward:{}", interface),
            FirewallRule::NetworkBridge { a, b, .. } => {
                let (lo, hi) = order_pair(a, b);
                format!("bridge:{}:{}", lo, hi)
            },
        }
    }
}

pub fn bridge_key(a: &InterfaceName, b: &InterfaceName) -> String {
    let (lo, hi) = order_pair(a, b);
    format!("bridge:{}:{}", lo, hi)
}

fn order_pair<'a>(a: &'a InterfaceName, b: &'a InterfaceName) -> (String, String) {
    let a = a.as_str_lossy().to_string();
    let b = b.as_str_lossy().to_string();
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
