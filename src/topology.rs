//! Topology description
//!
//! This module provides:
//! - A single node registry keyed by name, with the kind as a tagged variant
//! - Link declaration between node interfaces (see [`link`])
//! - Layer-2 segment analysis for dry validation
//!
//! Nothing here touches the kernel or the container runtime; a topology is
//! pure description until handed to [`crate::runtime::NetworkRuntime`].

pub mod link;
pub mod node;

pub use link::{Endpoint, EndpointParams, Link, LinkId, LinkOptions};
pub use node::{AddressOrigin, Interface, Node, NodeHandle, NodeKind};

use crate::address::AddressAllocator;
use crate::error::{Error, Result};
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tracing::debug;

/// A (node, interface) pair used when reporting segments
pub type PortRef = (String, String);

/// Nodes and links in creation order
#[derive(Debug)]
pub struct Topology {
    /// Nodes in creation order
    nodes: Vec<Node>,
    /// Name -> handle
    index: HashMap<String, NodeHandle>,
    /// Links in creation order
    links: Vec<Link>,
    /// Next link identifier
    next_link: u64,
    /// Address allocator shared by every link
    allocator: AddressAllocator,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Create an empty topology drawing default addresses from 10.0.0.0/8
    pub fn new() -> Self {
        Self::with_allocator(AddressAllocator::default())
    }

    /// Create an empty topology with a custom allocator
    pub fn with_allocator(allocator: AddressAllocator) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            links: Vec::new(),
            next_link: 0,
            allocator,
        }
    }

    /// Declare a process-backed host
    pub fn add_host(&mut self, name: &str) -> Result<NodeHandle> {
        self.add_node(name, NodeKind::ProcessHost, None)
    }

    /// Declare a process-backed host with an explicit address
    pub fn add_host_with_ip(&mut self, name: &str, ip: &str) -> Result<NodeHandle> {
        self.add_node(name, NodeKind::ProcessHost, Some(ip))
    }

    /// Declare a switch
    pub fn add_switch(&mut self, name: &str) -> Result<NodeHandle> {
        self.add_node(name, NodeKind::Switch, None)
    }

    /// Declare a container-backed host.
    ///
    /// No container exists until the network is started.
    pub fn add_container(
        &mut self,
        name: &str,
        image: &str,
        ip: Option<&str>,
    ) -> Result<NodeHandle> {
        if image.trim().is_empty() {
            return Err(Error::ConfigValidation(format!(
                "container '{}' needs an image",
                name
            )));
        }
        let kind = NodeKind::ContainerHost {
            image: image.to_string(),
        };
        self.add_node(name, kind, ip)
    }

    fn add_node(&mut self, name: &str, kind: NodeKind, ip: Option<&str>) -> Result<NodeHandle> {
        if self.index.contains_key(name) {
            return Err(Error::DuplicateNode(name.to_string()));
        }
        if !node::valid_node_name(name) {
            return Err(Error::InvalidNodeName(name.to_string()));
        }

        let declared = match ip {
            Some(value) => {
                let net = self.allocator.parse(value)?;
                self.allocator.reserve(net, name)?;
                Some(net)
            }
            None => None,
        };

        let handle = NodeHandle(self.nodes.len());
        debug!(node = name, kind = %kind, "declared node");
        self.nodes.push(Node::new(name, kind, declared));
        self.index.insert(name.to_string(), handle);
        Ok(handle)
    }

    /// Resolve a node name to its handle
    pub fn handle(&self, name: &str) -> Option<NodeHandle> {
        self.index.get(name).copied()
    }

    /// Resolve a node name, failing with `LinkEndpointInvalid` if unknown
    pub fn require(&self, name: &str) -> Result<NodeHandle> {
        self.handle(name)
            .ok_or_else(|| Error::LinkEndpointInvalid(format!("node '{}' does not exist", name)))
    }

    /// Get a node by handle
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by a different topology.
    pub fn node(&self, handle: NodeHandle) -> &Node {
        &self.nodes[handle.0]
    }

    /// Get a node by name
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.handle(name).map(|h| &self.nodes[h.0])
    }

    /// Nodes in creation order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeHandle(i), n))
    }

    /// Nodes that terminate traffic (hosts and containers)
    pub fn hosts(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes().filter(|(_, n)| n.kind.is_host())
    }

    /// Links in creation order
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Number of declared nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node has been declared
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of declared container hosts
    pub fn container_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind.is_container()).count()
    }

    /// The allocator backing this topology
    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Group every interface into layer-2 segments.
    ///
    /// Links join their two endpoints and switches join all of their ports;
    /// hosts never forward between their own interfaces.
    pub fn segments(&self) -> Vec<Vec<PortRef>> {
        let (ports, uf) = self.port_sets();
        let mut groups: BTreeMap<usize, Vec<PortRef>> = BTreeMap::new();
        for (idx, (node, intf)) in ports.iter().enumerate() {
            let root = uf.find(idx);
            groups.entry(root).or_default().push((
                self.nodes[*node].name.clone(),
                self.nodes[*node].interfaces[*intf].name.clone(),
            ));
        }
        groups.into_values().collect()
    }

    /// Whether a probe from `src` to `dst` should succeed on this topology.
    ///
    /// The source picks its outgoing interface by longest-prefix match and
    /// the destination must hold `dst` on an interface in the same segment.
    pub fn expected_reachable(&self, src: NodeHandle, dst: &IpAddr) -> bool {
        let source = &self.nodes[src.0];
        if source.owns_address(dst) {
            return true;
        }
        let Some(out) = source.route_to(dst) else {
            return false;
        };

        let (ports, uf) = self.port_sets();
        let position = |node: usize, name: &str| {
            ports.iter().position(|(n, i)| {
                *n == node && self.nodes[*n].interfaces[*i].name == name
            })
        };
        let Some(out_idx) = position(src.0, &out.name) else {
            return false;
        };

        self.nodes.iter().enumerate().any(|(n, node)| {
            node.interfaces.iter().any(|intf| {
                intf.address.is_some_and(|a| a.addr() == *dst)
                    && position(n, &intf.name).is_some_and(|idx| uf.equiv(idx, out_idx))
            })
        })
    }

    /// Whether every ordered host pair can reach the other's default address
    pub fn expected_full_mesh(&self) -> bool {
        let hosts: Vec<_> = self.hosts().collect();
        hosts.iter().all(|(src, _)| {
            hosts.iter().all(|(dst, node)| {
                src == dst
                    || node
                        .default_address()
                        .is_some_and(|addr| self.expected_reachable(*src, &addr))
            })
        })
    }

    /// Flatten all interfaces and union them into segments
    fn port_sets(&self) -> (Vec<(usize, usize)>, UnionFind<usize>) {
        let ports: Vec<(usize, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(n, node)| (0..node.interfaces.len()).map(move |i| (n, i)))
            .collect();
        let lookup: HashMap<(usize, &str), usize> = ports
            .iter()
            .enumerate()
            .map(|(idx, (n, i))| ((*n, self.nodes[*n].interfaces[*i].name.as_str()), idx))
            .collect();

        let mut uf = UnionFind::new(ports.len());
        for link in &self.links {
            let [a, b] = &link.endpoints;
            if let (Some(x), Some(y)) = (
                lookup.get(&(a.node.0, a.interface.as_str())),
                lookup.get(&(b.node.0, b.interface.as_str())),
            ) {
                uf.union(*x, *y);
            }
        }

        for (n, node) in self.nodes.iter().enumerate() {
            if node.kind != NodeKind::Switch {
                continue;
            }
            let members: Vec<usize> = node
                .interfaces
                .iter()
                .filter_map(|i| lookup.get(&(n, i.name.as_str())).copied())
                .collect();
            for pair in members.windows(2) {
                uf.union(pair[0], pair[1]);
            }
        }

        (ports, uf)
    }
}
