//! Link subnet allocator
//!
//! Carves `/30` point-to-point subnets out of a private pool (a `/16` by
//! default, giving 16384 subnets). Allocation is a pure query over the subnets
//! already in use and always returns the lowest free one, so the same
//! registry contents produce the same answer on every host.

use crate::RegistryError;
use ipnetwork::Ipv4Network;
use l2link_proto::{Side, LINK_PREFIX};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Number of addresses in one link subnet
const LINK_SIZE: u32 = 4;

/// Private address pool the link subnets are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Network,
}

impl AddressPool {
    /// Create a pool from a network in CIDR notation.
    ///
    /// Host bits are cleared, so `10.30.5.9/16` describes `10.30.0.0/16`.
    pub fn new(network: Ipv4Network) -> Result<Self, RegistryError> {
        if network.prefix() > LINK_PREFIX {
            return Err(RegistryError::Validation(format!(
                "address pool {} is smaller than a /{} link",
                network, LINK_PREFIX
            )));
        }
        let network = Ipv4Network::new(network.network(), network.prefix())
            .map_err(|e| RegistryError::Validation(e.to_string()))?;
        Ok(Self { network })
    }

    /// Parse a pool such as `10.30.0.0/16`
    pub fn parse(cidr: &str) -> Result<Self, RegistryError> {
        let network: Ipv4Network = cidr
            .parse()
            .map_err(|_| RegistryError::Validation(format!("invalid address pool '{}'", cidr)))?;
        Self::new(network)
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    /// Total number of `/30` subnets in the pool
    pub fn capacity(&self) -> u32 {
        1u32 << (LINK_PREFIX - self.network.prefix())
    }

    /// The `index`-th subnet of the pool in ascending order
    pub fn subnet_at(&self, index: u32) -> Option<Ipv4Network> {
        if index >= self.capacity() {
            return None;
        }
        let base = u32::from(self.network.network()) + index * LINK_SIZE;
        Ipv4Network::new(Ipv4Addr::from(base), LINK_PREFIX).ok()
    }

    /// Whether a link subnet lies entirely inside the pool
    pub fn contains(&self, subnet: Ipv4Network) -> bool {
        subnet.prefix() >= self.network.prefix() && self.network.contains(subnet.network())
    }

    /// Lowest free `/30` given the subnets already in use
    pub fn allocate<I>(&self, used: I) -> Result<Ipv4Network, RegistryError>
    where
        I: IntoIterator<Item = Ipv4Network>,
    {
        let used: HashSet<u32> = used
            .into_iter()
            .map(|subnet| u32::from(subnet.network()))
            .collect();

        (0..self.capacity())
            .filter_map(|index| self.subnet_at(index))
            .find(|subnet| !used.contains(&u32::from(subnet.network())))
            .ok_or_else(|| RegistryError::PoolExhausted {
                pool: self.network.to_string(),
            })
    }

    /// The address a side owns within a link subnet, e.g. `10.30.0.1/30` for A
    pub fn host_for(subnet: Ipv4Network, side: Side) -> Ipv4Network {
        let host = u32::from(subnet.network()) + side.host_offset();
        Ipv4Network::new(Ipv4Addr::from(host), LINK_PREFIX).unwrap_or(subnet)
    }

    /// The other endpoint's address within the same link subnet
    pub fn peer_of(interface_ip: Ipv4Network, side: Side) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(interface_ip.network()) + side.peer().host_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_pool_capacity() {
        let pool = AddressPool::parse(l2link_proto::DEFAULT_POOL).unwrap();
        assert_eq!(pool.capacity(), 16384);
        assert_eq!(pool.subnet_at(0), Some(net("10.30.0.0/30")));
        assert_eq!(pool.subnet_at(16383), Some(net("10.30.255.252/30")));
        assert_eq!(pool.subnet_at(16384), None);
    }

    #[test]
    fn test_allocate_lowest_free() {
        let pool = AddressPool::parse("10.30.0.0/16").unwrap();
        assert_eq!(pool.allocate(Vec::new()).unwrap(), net("10.30.0.0/30"));

        let used = [net("10.30.0.0/30"), net("10.30.0.4/30")];
        assert_eq!(pool.allocate(used).unwrap(), net("10.30.0.8/30"));
    }

    #[test]
    fn test_allocate_fills_gaps() {
        let pool = AddressPool::parse("10.30.0.0/16").unwrap();
        let used = [net("10.30.0.0/30"), net("10.30.0.8/30")];
        assert_eq!(pool.allocate(used).unwrap(), net("10.30.0.4/30"));
    }

    #[test]
    fn test_allocate_matches_host_addresses() {
        // Subnets are compared by their base, whichever host the caller holds
        let pool = AddressPool::parse("10.30.0.0/16").unwrap();
        let used = [net("10.30.0.1/30"), net("10.30.0.6/30")];
        assert_eq!(pool.allocate(used).unwrap(), net("10.30.0.8/30"));
    }

    #[test]
    fn test_full_pool_is_exhausted() {
        let pool = AddressPool::parse("10.30.0.0/16").unwrap();
        let used: Vec<Ipv4Network> = (0..pool.capacity())
            .filter_map(|i| pool.subnet_at(i))
            .collect();
        assert_eq!(used.len(), 16384);
        assert!(matches!(
            pool.allocate(used),
            Err(RegistryError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_host_and_peer_addresses() {
        let subnet = net("10.30.0.8/30");
        let a = AddressPool::host_for(subnet, Side::A);
        let b = AddressPool::host_for(subnet, Side::B);
        assert_eq!(a, net("10.30.0.9/30"));
        assert_eq!(b, net("10.30.0.10/30"));
        assert_eq!(AddressPool::peer_of(a, Side::A), b.ip());
        assert_eq!(AddressPool::peer_of(b, Side::B), a.ip());
    }

    #[test]
    fn test_contains() {
        let pool = AddressPool::parse("10.30.0.0/16").unwrap();
        assert!(pool.contains(net("10.30.200.4/30")));
        assert!(!pool.contains(net("10.31.0.0/30")));
        assert!(!pool.contains(net("10.0.0.0/8")));
    }

    #[test]
    fn test_rejects_pool_smaller_than_link() {
        assert!(AddressPool::parse("10.30.0.0/31").is_err());
        assert!(AddressPool::parse("not-a-network").is_err());
        assert_eq!(
            AddressPool::parse("10.30.5.9/16").unwrap().network(),
            net("10.30.0.0/16")
        );
    }
}
