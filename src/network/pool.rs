//! Deterministic address allocation from a bridge CIDR

use crate::error::{ComposeError, Result};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Default bridge network instances draw their addresses from
pub const DEFAULT_BRIDGE: &str = "10.22.0.0/16";

/// Instance name to address, in assignment order
pub type AddressAssignment = IndexMap<String, Ipv4Addr>;

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Network address
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    /// Usable host addresses in ascending order. For /31 and /32 every
    /// address is a host; otherwise network and broadcast are excluded.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network);
        let last = base | !self.mask();

        let (first, last) = match self.prefix {
            32 => (base, base),
            31 => (base, last),
            _ => (base + 1, last - 1),
        };

        (first..=last).map(Ipv4Addr::from)
    }
}

impl FromStr for Cidr {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ComposeError::InvalidCidr(s.to_string());

        let (address, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let network: Ipv4Addr = address.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }

        let cidr = Cidr { network, prefix };
        if u32::from(network) & !cidr.mask() != 0 {
            // host bits set
            return Err(invalid());
        }

        Ok(cidr)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Address pool for a single create/up invocation.
///
/// The first host address is reserved for the gateway. Addresses held by
/// instances that are already running are never handed out again.
pub struct AddressPool {
    cidr: Cidr,
    hosts: Box<dyn Iterator<Item = Ipv4Addr>>,
    running: AddressAssignment,
    claimed: HashSet<Ipv4Addr>,
}

impl AddressPool {
    /// Create a pool over `cidr`, aware of already running instances
    pub fn new(cidr: &str, running: AddressAssignment) -> Result<Self> {
        let cidr: Cidr = cidr.parse()?;
        let mut hosts = cidr.hosts();

        // gateway
        hosts.next();

        let claimed = running.values().copied().collect();

        Ok(Self {
            cidr,
            hosts: Box::new(hosts),
            running,
            claimed,
        })
    }

    /// The network addresses are drawn from
    pub fn cidr(&self) -> Cidr {
        self.cidr
    }

    /// Draw the next free address
    fn next_free(&mut self, name: &str) -> Result<Ipv4Addr> {
        for candidate in self.hosts.by_ref() {
            if self.claimed.insert(candidate) {
                return Ok(candidate);
            }
        }

        Err(ComposeError::AddressPoolExhausted {
            cidr: self.cidr.to_string(),
            instance: name.to_string(),
        })
    }

    /// Assign an address to each of `names`, in order.
    ///
    /// Running instances that are not being assigned keep their current
    /// address in the result so a hosts file built from it stays complete.
    pub fn allocate(mut self, names: &[String]) -> Result<AddressAssignment> {
        let mut assignment = AddressAssignment::new();

        for name in names {
            let address = self.next_free(name)?;
            tracing::debug!("Assigned {} to {}", address, name);
            assignment.insert(name.clone(), address);
        }

        for (name, address) in &self.running {
            if !assignment.contains_key(name) {
                assignment.insert(name.clone(), *address);
            }
        }

        Ok(assignment)
    }
}
