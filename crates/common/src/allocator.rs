//! Address allocation
//!
//! Availability is computed from current state on every call: the caller
//! passes the set of addresses already taken (config blocks plus ledger
//! leases) and the allocator returns the lowest free host address. There is
//! no allocation table to release or go stale.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// Picks unused host addresses from a subnet
#[derive(Debug, Clone)]
pub struct IpAllocator {
    subnet: Ipv4Network,
    gateway: Ipv4Addr,
}

impl IpAllocator {
    pub fn new(subnet: Ipv4Network, gateway: Ipv4Addr) -> Self {
        Self { subnet, gateway }
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Lowest host address not in `reserved`
    pub fn allocate(&self, reserved: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        let address = self
            .hosts()
            .find(|ip| *ip != self.gateway && !reserved.contains(ip))
            .ok_or_else(|| Error::AddressSpaceExhausted {
                subnet: self.subnet.to_string(),
            })?;
        debug!("Allocated {} from {}", address, self.subnet);
        Ok(address)
    }

    /// True if `ip` could ever be leased
    pub fn is_leasable(&self, ip: Ipv4Addr) -> bool {
        ip != self.gateway && self.hosts().any(|h| h == ip)
    }

    /// Number of leasable addresses in the subnet
    pub fn capacity(&self) -> usize {
        self.hosts().filter(|ip| *ip != self.gateway).count()
    }

    /// Host addresses in ascending order, without network and broadcast
    fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        let (first, last) = if broadcast - network < 2 {
            // /31 and /32 have no host range here
            (1, 0)
        } else {
            (network + 1, broadcast - 1)
        };
        (first..=last).map(Ipv4Addr::from)
    }
}
