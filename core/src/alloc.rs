use std::{collections::HashSet, net::IpAddr};

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::error::CoreError;

/// Hands out unused host addresses from a subnet. The network address, the
/// broadcast address and the reserved server address (the subnet's first
/// usable host) are seeded into the used set up front, so a fresh allocator
/// never hands any of them back.
///
/// All operations go through a single instance-local lock.
pub struct IpAllocator {
    subnet: IpNet,
    server_ip: IpAddr,
    used: Mutex<HashSet<IpAddr>>,
}

impl IpAllocator {
    /// Builds an allocator over `subnet`, pre-seeding `used` (e.g. addresses
    /// already assigned to existing peers) alongside the network, broadcast
    /// and server addresses.
    pub fn new(subnet: IpNet, used: impl IntoIterator<Item = IpAddr>) -> Self {
        let server_ip = subnet.hosts().next().expect("subnet has usable hosts");
        let mut seeded: HashSet<IpAddr> = used.into_iter().collect();
        seeded.insert(subnet.network());
        seeded.insert(subnet.broadcast());
        seeded.insert(server_ip);
        Self {
            subnet,
            server_ip,
            used: Mutex::new(seeded),
        }
    }

    /// The subnet's reserved server address.
    pub fn server_ip(&self) -> IpAddr {
        self.server_ip
    }

    /// Returns the numerically smallest usable host address not already in
    /// use, marking it used. Iteration order over `hosts()` is the subnet's
    /// natural big-endian numeric order for both IPv4 and IPv6.
    pub fn allocate(&self) -> Result<IpAddr, CoreError> {
        let mut used = self.used.lock();
        for ip in self.subnet.hosts() {
            if ip == self.subnet.broadcast() {
                continue;
            }
            if !used.contains(&ip) {
                used.insert(ip);
                return Ok(ip);
            }
        }
        Err(CoreError::Exhausted)
    }

    /// Returns `ip` to the pool. Idempotent: releasing an address that
    /// isn't allocated, or the reserved server address, is a no-op as far
    /// as future allocations are concerned (the server address is
    /// re-inserted immediately after removal would have no observable
    /// effect, so it's simply never removed).
    pub fn release(&self, ip: IpAddr) {
        if ip == self.server_ip {
            return;
        }
        self.used.lock().remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_exhaustion() {
        let subnet: IpNet = "10.0.0.0/30".parse().unwrap();
        let allocator = IpAllocator::new(subnet, []);
        assert_eq!(allocator.server_ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(allocator.allocate().unwrap(), "10.0.0.2".parse::<IpAddr>().unwrap());
        assert!(matches!(allocator.allocate(), Err(CoreError::Exhausted)));
    }

    #[test]
    fn test_release_then_reallocate() {
        let subnet: IpNet = "10.0.0.0/29".parse().unwrap();
        let allocator = IpAllocator::new(subnet, []);
        let first = allocator.allocate().unwrap();
        allocator.release(first);
        let second = allocator.allocate().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_releasing_server_ip_is_a_no_op() {
        let subnet: IpNet = "10.0.0.0/29".parse().unwrap();
        let allocator = IpAllocator::new(subnet, []);
        allocator.release(allocator.server_ip());
        let allocated: Vec<_> = (0..5).map(|_| allocator.allocate().unwrap()).collect();
        assert!(!allocated.contains(&allocator.server_ip()));
    }

    #[test]
    fn test_never_allocates_network_or_broadcast() {
        let subnet: IpNet = "10.0.0.0/28".parse().unwrap();
        let allocator = IpAllocator::new(subnet, []);
        for _ in 0..13 {
            let ip = allocator.allocate().unwrap();
            assert_ne!(ip, subnet.network());
            assert_ne!(ip, subnet.broadcast());
        }
        assert!(matches!(allocator.allocate(), Err(CoreError::Exhausted)));
    }
}
