//! Node, interface and handle types

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

use super::link::LinkId;

/// Maximum node name length (leaves room for "-eth999" inside IFNAMSIZ)
pub const MAX_NODE_NAME: usize = 8;

/// Stable handle to a node, valid for the topology that issued it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub(crate) usize);

impl NodeHandle {
    /// Position of the node in creation order
    pub fn index(&self) -> usize {
        self.0
    }
}

/// What backs a node at runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Process-backed host living in its own network namespace
    ProcessHost,
    /// Bridge living in its own network namespace
    Switch,
    /// Host whose network stack belongs to a runtime-managed container
    ContainerHost {
        /// Image the container is launched from
        image: String,
    },
}

impl NodeKind {
    /// Whether the node terminates traffic (and therefore takes addresses)
    pub fn is_host(&self) -> bool {
        !matches!(self, NodeKind::Switch)
    }

    /// Whether the node is backed by a container
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::ContainerHost { .. })
    }

    /// Short label for display
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::ProcessHost => "host",
            NodeKind::Switch => "switch",
            NodeKind::ContainerHost { .. } => "container",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::ContainerHost { image } => write!(f, "container({})", image),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Where an interface address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOrigin {
    /// Drawn from the allocator's base network
    Allocated,
    /// Explicit `ip` override on the link endpoint
    Override,
    /// Address declared on the node at creation
    Declared,
}

/// A named attachment point on a node
#[derive(Debug, Clone)]
pub struct Interface {
    /// Interface name, unique within the node (e.g. "d1-eth0")
    pub name: String,
    /// Assigned address, if any (switch ports carry none)
    pub address: Option<IpNet>,
    /// Origin of the address
    pub origin: Option<AddressOrigin>,
    /// The link this interface belongs to
    pub link: LinkId,
}

/// A node in the topology
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique name
    pub name: String,
    /// Node kind (carries kind-specific metadata)
    pub kind: NodeKind,
    /// Interfaces in creation order
    pub interfaces: Vec<Interface>,
    /// Address declared at creation
    pub declared: Option<IpNet>,
    /// Whether the declared address is currently bound to an interface
    pub(crate) declared_in_use: bool,
    /// Next interface index (never decreases)
    pub(crate) next_intf: u32,
}

impl Node {
    pub(crate) fn new(name: &str, kind: NodeKind, declared: Option<IpNet>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            interfaces: Vec::new(),
            declared,
            declared_in_use: false,
            next_intf: 0,
        }
    }

    /// The address of the first addressed interface
    pub fn default_address(&self) -> Option<IpAddr> {
        self.interfaces
            .iter()
            .find_map(|i| i.address.map(|a| a.addr()))
    }

    /// Look up an interface by name
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Whether any interface holds `addr`
    pub fn owns_address(&self, addr: &IpAddr) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.address.is_some_and(|a| a.addr() == *addr))
    }

    /// Name the next interface would get
    pub(crate) fn next_interface_name(&self) -> String {
        format!("{}-eth{}", self.name, self.next_intf)
    }

    /// Pick the interface the kernel would route `dst` out of.
    ///
    /// Longest prefix wins; the earliest interface wins ties.
    pub fn route_to(&self, dst: &IpAddr) -> Option<&Interface> {
        let mut best: Option<&Interface> = None;
        for intf in &self.interfaces {
            let Some(net) = intf.address else { continue };
            if !net.contains(dst) {
                continue;
            }
            let better = match best.and_then(|b| b.address) {
                Some(current) => net.prefix_len() > current.prefix_len(),
                None => true,
            };
            if better {
                best = Some(intf);
            }
        }
        best
    }
}

/// Validate a node name for use in namespace and interface names
pub(crate) fn valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NODE_NAME
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
