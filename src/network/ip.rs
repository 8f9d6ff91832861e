//! IP address management for lab networks
//!
//! Provides:
//! - Subnet parsing and address assignability rules
//! - Per-network IP pools
//! - Deterministic assignment of explicit and automatic addresses

use crate::error::{AllocationError, Result};
use crate::topology::{AddressBinding, NetworkSpec};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::HashSet;
use std::net::IpAddr;

/// Upper bound on IPv6 candidates scanned per automatic assignment
const V6_SCAN_LIMIT: usize = 65536;

/// Parse a CIDR block, rejecting blocks with host bits set
pub fn parse_subnet(text: &str) -> std::result::Result<IpNet, String> {
    let net: IpNet = text
        .parse()
        .map_err(|e: ipnet::AddrParseError| e.to_string())?;
    if net.trunc() != net {
        return Err(format!("host bits are set, expected {}", net.trunc()));
    }
    Ok(net)
}

/// Check whether an address may be bound to a host in a subnet
///
/// The network address is never assignable, nor the IPv4 broadcast address.
/// Point-to-point (/31, /127) and single-address blocks use every address.
pub fn is_assignable(subnet: &IpNet, addr: IpAddr) -> bool {
    if !subnet.contains(&addr) {
        return false;
    }
    match subnet {
        IpNet::V4(net) if net.prefix_len() < 31 => {
            addr != IpAddr::V4(net.network()) && addr != IpAddr::V4(net.broadcast())
        }
        IpNet::V6(net) if net.prefix_len() < 127 => addr != IpAddr::V6(net.network()),
        _ => true,
    }
}

/// IP address pool for one network
#[derive(Debug, Clone)]
pub struct IpPool {
    /// Network name, for error reporting
    network: String,
    /// Network subnet
    subnet: IpNet,
    /// Set of allocated addresses (including the reserved gateway)
    allocated: HashSet<IpAddr>,
}

impl IpPool {
    /// Create a pool for a network, reserving its gateway if one is declared
    pub fn new(spec: &NetworkSpec) -> Result<Self> {
        let subnet = spec.cidr()?;
        let mut allocated = HashSet::new();
        if let Some(gateway) = spec.gateway {
            allocated.insert(gateway);
        }

        Ok(Self {
            network: spec.name.clone(),
            subnet,
            allocated,
        })
    }

    /// Allocate the next available address for a host
    pub fn allocate(&mut self, host: &str) -> std::result::Result<IpAddr, AllocationError> {
        let next = match self.subnet {
            IpNet::V4(net) => self.next_v4(net),
            IpNet::V6(net) => self.next_v6(net),
        };

        match next {
            Some(ip) => {
                self.allocated.insert(ip);
                Ok(ip)
            }
            None => Err(AllocationError::SubnetExhausted {
                network: self.network.clone(),
                host: host.to_string(),
            }),
        }
    }

    /// Allocate a specific address for a host
    pub fn allocate_specific(
        &mut self,
        host: &str,
        addr: IpAddr,
    ) -> std::result::Result<(), AllocationError> {
        if !is_assignable(&self.subnet, addr) {
            return Err(AllocationError::AddressOutOfRange {
                network: self.network.clone(),
                host: host.to_string(),
                address: addr,
                subnet: self.subnet.to_string(),
            });
        }

        if !self.allocated.insert(addr) {
            return Err(AllocationError::AddressConflict {
                network: self.network.clone(),
                host: host.to_string(),
                address: addr,
            });
        }

        Ok(())
    }

    fn next_v4(&self, net: Ipv4Net) -> Option<IpAddr> {
        // hosts() already skips network and broadcast
        net.hosts()
            .map(IpAddr::V4)
            .find(|ip| !self.allocated.contains(ip))
    }

    fn next_v6(&self, net: Ipv6Net) -> Option<IpAddr> {
        net.hosts()
            .map(IpAddr::V6)
            .filter(|ip| is_assignable(&self.subnet, *ip))
            .take(V6_SCAN_LIMIT)
            .find(|ip| !self.allocated.contains(ip))
    }

    #[cfg(test)]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

/// Assign an address to every request on a network
///
/// `requests` holds (host, optional explicit address) pairs. Explicit
/// addresses are reserved first and kept as requested; the remaining hosts
/// get the next free addresses in ascending host name order. Bindings are
/// returned in request order.
pub fn assign(spec: &NetworkSpec, requests: &[(&str, Option<IpAddr>)]) -> Result<Vec<AddressBinding>> {
    let mut pool = IpPool::new(spec)?;
    let mut assigned: Vec<Option<IpAddr>> = vec![None; requests.len()];

    for (slot, (host, addr)) in assigned.iter_mut().zip(requests) {
        if let Some(addr) = addr {
            pool.allocate_specific(host, *addr)?;
            *slot = Some(*addr);
        }
    }

    let mut automatic: Vec<usize> = (0..requests.len())
        .filter(|i| requests[*i].1.is_none())
        .collect();
    automatic.sort_by_key(|i| requests[*i].0);

    for i in automatic {
        let host = requests[i].0;
        let ip = pool.allocate(host)?;
        log::debug!("Auto-assigned {} to '{}' on network '{}'", ip, host, spec.name);
        assigned[i] = Some(ip);
    }

    Ok(requests
        .iter()
        .zip(assigned)
        .filter_map(|((host, _), address)| {
            address.map(|address| AddressBinding {
                host: host.to_string(),
                network: spec.name.clone(),
                address,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ip_pool_creation() {
        let spec = NetworkSpec::new("lab", "10.0.1.0/24").gateway(ip("10.0.1.1"));
        let pool = IpPool::new(&spec).unwrap();
        assert_eq!(pool.allocated_count(), 1); // Gateway is reserved

        let spec = NetworkSpec::new("lab", "10.0.1.0/24");
        let pool = IpPool::new(&spec).unwrap();
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_ip_allocation() {
        let spec = NetworkSpec::new("lab", "10.0.1.0/24").gateway(ip("10.0.1.1"));
        let mut pool = IpPool::new(&spec).unwrap();

        // Gateway is 10.0.1.1, so first allocation should be 10.0.1.2
        let first = pool.allocate("a").unwrap();
        assert_eq!(first, IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2)));

        let second = pool.allocate("b").unwrap();
        assert_eq!(second, IpAddr::V4(Ipv4Addr::new(10, 0, 1, 3)));
    }

    #[test]
    fn test_specific_allocation() {
        let spec = NetworkSpec::new("lab", "10.0.1.0/24");
        let mut pool = IpPool::new(&spec).unwrap();

        pool.allocate_specific("a", ip("10.0.1.100")).unwrap();
        assert_eq!(
            pool.allocate_specific("b", ip("10.0.1.100")),
            Err(AllocationError::AddressConflict {
                network: "lab".into(),
                host: "b".into(),
                address: ip("10.0.1.100"),
            })
        );
        assert!(matches!(
            pool.allocate_specific("c", ip("10.0.2.1")),
            Err(AllocationError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            pool.allocate_specific("d", ip("10.0.1.255")),
            Err(AllocationError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn test_assign_orders_automatic_by_host_name() {
        let spec = NetworkSpec::new("lab-network", "10.11.0.0/24");
        let requests = [
            ("zeta", None),
            ("target", Some(ip("10.11.0.1"))),
            ("alpha", None),
            ("mid", None),
        ];

        let bindings = assign(&spec, &requests).unwrap();
        let got: Vec<_> = bindings
            .iter()
            .map(|b| (b.host.as_str(), b.address))
            .collect();
        assert_eq!(
            got,
            vec![
                ("zeta", ip("10.11.0.4")),
                ("target", ip("10.11.0.1")),
                ("alpha", ip("10.11.0.2")),
                ("mid", ip("10.11.0.3")),
            ]
        );
        assert!(bindings.iter().all(|b| b.network == "lab-network"));
    }

    #[test]
    fn test_assign_is_deterministic() {
        let spec = NetworkSpec::new("lab", "10.11.0.0/28");
        let requests = [("b", None), ("a", None), ("c", Some(ip("10.11.0.2")))];
        assert_eq!(
            assign(&spec, &requests).unwrap(),
            assign(&spec, &requests).unwrap()
        );
    }

    #[test]
    fn test_assign_duplicate_explicit() {
        let spec = NetworkSpec::new("lab-network", "10.11.0.0/24");
        let requests = [
            ("a", Some(ip("10.11.0.65"))),
            ("b", Some(ip("10.11.0.65"))),
        ];
        let err = assign(&spec, &requests).unwrap_err();
        assert!(matches!(
            err,
            Error::Allocation(AllocationError::AddressConflict { ref host, .. }) if host == "b"
        ));
    }

    #[test]
    fn test_subnet_exhausted() {
        // /30 leaves two usable addresses
        let spec = NetworkSpec::new("tiny", "10.11.0.0/30");
        let requests = [("a", None), ("b", None), ("c", None)];
        let err = assign(&spec, &requests).unwrap_err();
        assert!(matches!(
            err,
            Error::Allocation(AllocationError::SubnetExhausted { ref host, .. }) if host == "c"
        ));
    }

    #[test]
    fn test_point_to_point_uses_both_addresses() {
        let spec = NetworkSpec::new("p2p", "10.11.0.0/31");
        let bindings = assign(&spec, &[("a", None), ("b", None)]).unwrap();
        assert_eq!(bindings[0].address, ip("10.11.0.0"));
        assert_eq!(bindings[1].address, ip("10.11.0.1"));
    }

    #[test]
    fn test_ipv6_skips_network_address() {
        let spec = NetworkSpec::new("v6", "fd00:11::/64");
        let bindings = assign(&spec, &[("a", None)]).unwrap();
        assert_eq!(bindings[0].address, ip("fd00:11::1"));
    }

    #[test]
    fn test_parse_subnet() {
        assert!(parse_subnet("10.11.0.0/24").is_ok());
        assert!(parse_subnet("10.11.0.0").is_err());
        assert!(parse_subnet("10.11.0.9/24").is_err());
        assert!(parse_subnet("fd00::/64").is_ok());
    }
}
