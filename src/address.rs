//! IP address management for emulated interfaces
//!
//! Provides:
//! - Monotonic default allocation from a private base network
//! - Explicit reservations (link overrides, node-declared addresses)
//! - Conflict detection across every assigned address

use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Default base network for automatic assignment
pub const DEFAULT_IP_BASE: &str = "10.0.0.0/8";

/// Prefix length used for bare IPv6 addresses without an explicit prefix
const DEFAULT_V6_PREFIX: u8 = 64;

#[derive(Debug)]
struct AllocState {
    /// Offset of the next candidate host inside the base network
    cursor: u32,
    /// Assigned address -> owner label (e.g. "d1-eth0")
    assigned: HashMap<IpAddr, String>,
}

/// Hands out interface addresses and tracks every assignment.
///
/// All methods take `&self`; the assigned set is guarded by an internal
/// mutex so concurrent callers are serialized.
#[derive(Debug)]
pub struct AddressAllocator {
    base: Ipv4Net,
    state: Mutex<AllocState>,
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new(Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8))
    }
}

impl AddressAllocator {
    /// Create an allocator drawing default addresses from `base`
    pub fn new(base: Ipv4Net) -> Self {
        Self {
            base: base.trunc(),
            state: Mutex::new(AllocState {
                cursor: 0,
                assigned: HashMap::new(),
            }),
        }
    }

    /// Create an allocator from a CIDR string such as "10.0.0.0/8"
    pub fn from_cidr(base: &str) -> Result<Self> {
        let net: Ipv4Net = base
            .parse()
            .map_err(|_| Error::InvalidAddress(base.to_string()))?;
        Ok(Self::new(net))
    }

    /// The base network default addresses are drawn from
    pub fn base(&self) -> Ipv4Net {
        self.base
    }

    fn state(&self) -> MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate the next free default address for `owner`.
    ///
    /// The cursor only moves forward, so an address released earlier is
    /// not handed out again by this allocator.
    pub fn allocate(&self, owner: &str) -> Result<IpNet> {
        let (first, last) = self.host_range();
        let mut state = self.state();

        loop {
            let candidate = u64::from(first) + u64::from(state.cursor);
            if candidate > u64::from(last) {
                return Err(Error::AddressExhausted(self.base.to_string()));
            }
            state.cursor += 1;

            let addr = IpAddr::V4(Ipv4Addr::from(candidate as u32));
            if state.assigned.contains_key(&addr) {
                continue;
            }

            state.assigned.insert(addr, owner.to_string());
            let net = IpNet::new(addr, self.base.prefix_len())
                .map_err(|_| Error::InvalidAddress(addr.to_string()))?;
            debug!(%net, owner, "allocated default address");
            return Ok(net);
        }
    }

    /// Reserve an explicit address for `owner`, bypassing the cursor
    pub fn reserve(&self, net: IpNet, owner: &str) -> Result<()> {
        let addr = net.addr();
        if !is_host_address(&net) {
            return Err(Error::InvalidAddress(net.to_string()));
        }

        let mut state = self.state();
        if let Some(existing) = state.assigned.get(&addr) {
            return Err(Error::AddressConflict {
                addr,
                owner: existing.clone(),
            });
        }

        state.assigned.insert(addr, owner.to_string());
        debug!(%net, owner, "reserved explicit address");
        Ok(())
    }

    /// Release an assigned address
    pub fn release(&self, addr: &IpAddr) {
        if self.state().assigned.remove(addr).is_some() {
            debug!(%addr, "released address");
        }
    }

    /// Label of whoever holds `addr`
    pub fn owner_of(&self, addr: &IpAddr) -> Option<String> {
        self.state().assigned.get(addr).cloned()
    }

    /// Number of addresses currently assigned
    pub fn assigned_count(&self) -> usize {
        self.state().assigned.len()
    }

    /// Parse "addr/len" or a bare address.
    ///
    /// Bare IPv4 addresses take the base prefix length; bare IPv6
    /// addresses take /64.
    pub fn parse(&self, value: &str) -> Result<IpNet> {
        parse_cidr(value, self.base.prefix_len())
    }

    fn host_range(&self) -> (u32, u32) {
        let network = u32::from(self.base.network());
        let broadcast = u32::from(self.base.broadcast());
        if self.base.prefix_len() >= 31 {
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        }
    }
}

/// Parse a CIDR string, filling in `default_v4_prefix` when absent
pub fn parse_cidr(value: &str, default_v4_prefix: u8) -> Result<IpNet> {
    let value = value.trim();
    if value.contains('/') {
        return value
            .parse::<IpNet>()
            .map_err(|_| Error::InvalidAddress(value.to_string()));
    }

    let addr: IpAddr = value
        .parse()
        .map_err(|_| Error::InvalidAddress(value.to_string()))?;
    let prefix = match addr {
        IpAddr::V4(_) => default_v4_prefix,
        IpAddr::V6(_) => DEFAULT_V6_PREFIX,
    };
    IpNet::new(addr, prefix).map_err(|_| Error::InvalidAddress(value.to_string()))
}

/// Reject network and broadcast addresses for subnets that have them
fn is_host_address(net: &IpNet) -> bool {
    match net {
        IpNet::V4(v4) if v4.prefix_len() < 31 => {
            v4.addr() != v4.network() && v4.addr() != v4.broadcast()
        }
        IpNet::V4(_) => true,
        IpNet::V6(v6) => v6.prefix_len() == 128 || v6.addr() != v6.network(),
    }
}
