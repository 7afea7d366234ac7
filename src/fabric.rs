//! Kernel network plumbing
//!
//! `NetFabric` is the seam between the runtime and the host kernel. Every
//! namespace, veth pair and bridge the runtime materializes goes through
//! it, which keeps the lifecycle logic testable without root.

pub mod iproute;

pub use iproute::IpRoute;

use crate::error::Result;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Name of the bridge created inside every switch namespace
pub const SWITCH_BRIDGE: &str = "br0";

/// Reference to a network namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetnsRef {
    /// Named namespace under /run/netns
    Named(String),
    /// Namespace of a running process (container init)
    Pid(u32),
}

impl fmt::Display for NetnsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetnsRef::Named(name) => write!(f, "netns:{}", name),
            NetnsRef::Pid(pid) => write!(f, "pid:{}", pid),
        }
    }
}

/// Operations on the host's network stack.
///
/// Interfaces are created in the root namespace and then moved into
/// their target namespace. Deleting one end of a veth pair deletes both.
pub trait NetFabric: Send + Sync {
    /// Create a named namespace with loopback up
    fn create_namespace(&self, name: &str) -> Result<()>;

    /// Delete a named namespace; a missing namespace is not an error
    fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Names of all named namespaces on the host
    fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Names of all interfaces in `ns` (`None` is the root namespace)
    fn list_interfaces(&self, ns: Option<&NetnsRef>) -> Result<Vec<String>>;

    /// Create a veth pair in the root namespace
    fn create_veth(&self, a: &str, b: &str) -> Result<()>;

    /// Move a root-namespace interface into `target` and rename it
    fn move_interface(&self, ifname: &str, target: &NetnsRef, new_name: &str) -> Result<()>;

    /// Add an address to an interface
    fn set_address(&self, ns: &NetnsRef, ifname: &str, addr: &IpNet) -> Result<()>;

    /// Bring an interface up
    fn set_up(&self, ns: &NetnsRef, ifname: &str) -> Result<()>;

    /// Create a bridge device and bring it up
    fn create_bridge(&self, ns: &NetnsRef, bridge: &str) -> Result<()>;

    /// Enslave an interface to a bridge in the same namespace
    fn attach_to_bridge(&self, ns: &NetnsRef, ifname: &str, bridge: &str) -> Result<()>;

    /// Delete an interface; a missing interface is not an error.
    ///
    /// `ns` of `None` means the root namespace.
    fn delete_interface(&self, ns: Option<&NetnsRef>, ifname: &str) -> Result<()>;

    /// Send one echo request from `from` to `dst`.
    ///
    /// Returns `Ok(false)` when no reply arrives within `timeout`.
    fn ping(&self, from: &NetnsRef, dst: IpAddr, timeout: Duration) -> Result<bool>;
}
