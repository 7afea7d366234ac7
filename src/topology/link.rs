//! Virtual point-to-point links between node interfaces
//!
//! A link joins exactly two endpoints. Each endpoint gets a fresh interface
//! named after its node, and host endpoints get an address: the endpoint's
//! `ip` override, the node's declared address, or the next default.
//! Links are immutable; reconfiguring means remove + recreate.

use super::node::{AddressOrigin, Interface, NodeHandle, NodeKind};
use super::Topology;
use crate::error::{Error, Result};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Kernel interface name limit (IFNAMSIZ - 1)
const MAX_IFNAME: usize = 15;

/// Option keys accepted in per-endpoint configuration
const SUPPORTED_OPTIONS: &[&str] = &["ip"];

/// Stable link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.0)
    }
}

/// Per-endpoint configuration override map (e.g. `ip = "11.0.0.1/8"`)
pub type EndpointParams = BTreeMap<String, String>;

/// Overrides for both ends of a link
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Overrides for the first endpoint
    pub a: EndpointParams,
    /// Overrides for the second endpoint
    pub b: EndpointParams,
}

impl LinkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first endpoint's address ("addr/len")
    pub fn a_ip(mut self, cidr: impl Into<String>) -> Self {
        self.a.insert("ip".to_string(), cidr.into());
        self
    }

    /// Set the second endpoint's address ("addr/len")
    pub fn b_ip(mut self, cidr: impl Into<String>) -> Self {
        self.b.insert("ip".to_string(), cidr.into());
        self
    }
}

/// One side of a link
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Owning node
    pub node: NodeHandle,
    /// Interface created for this link
    pub interface: String,
    /// Override configuration as given by the caller
    pub params: EndpointParams,
}

/// A virtual point-to-point link
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub endpoints: [Endpoint; 2],
}

impl Link {
    /// The endpoint on the other side of `node`
    pub fn peer_of(&self, node: NodeHandle) -> Option<&Endpoint> {
        match (&self.endpoints[0], &self.endpoints[1]) {
            (a, b) if a.node == node => Some(b),
            (a, b) if b.node == node => Some(a),
            _ => None,
        }
    }
}

/// Address decided for one endpoint before anything is committed
struct Resolved {
    address: Option<IpNet>,
    origin: Option<AddressOrigin>,
}

impl Topology {
    /// Link two nodes with default addressing
    pub fn add_link(&mut self, a: NodeHandle, b: NodeHandle) -> Result<LinkId> {
        self.add_link_with(a, b, LinkOptions::default())
    }

    /// Link two nodes, applying per-endpoint overrides
    pub fn add_link_with(
        &mut self,
        a: NodeHandle,
        b: NodeHandle,
        options: LinkOptions,
    ) -> Result<LinkId> {
        self.check_endpoint(a)?;
        self.check_endpoint(b)?;
        if a == b {
            return Err(Error::LinkEndpointInvalid(format!(
                "cannot link '{}' to itself",
                self.nodes[a.0].name
            )));
        }

        let a_ip = self.parse_params(a, &options.a)?;
        let b_ip = self.parse_params(b, &options.b)?;

        let a_intf = self.nodes[a.0].next_interface_name();
        let b_intf = self.nodes[b.0].next_interface_name();
        for name in [&a_intf, &b_intf] {
            if name.len() > MAX_IFNAME {
                return Err(Error::LinkEndpointInvalid(format!(
                    "interface name '{}' exceeds {} characters",
                    name, MAX_IFNAME
                )));
            }
        }

        let a_res = self.resolve_address(a, &a_intf, a_ip)?;
        let b_res = match self.resolve_address(b, &b_intf, b_ip) {
            Ok(res) => res,
            Err(e) => {
                self.unresolve(&a_res);
                return Err(e);
            }
        };

        let id = LinkId(self.next_link);
        self.next_link += 1;

        self.commit_interface(a, &a_intf, a_res, id);
        self.commit_interface(b, &b_intf, b_res, id);

        debug!(
            %id,
            a = %a_intf,
            b = %b_intf,
            "declared link"
        );

        self.links.push(Link {
            id,
            endpoints: [
                Endpoint {
                    node: a,
                    interface: a_intf,
                    params: options.a,
                },
                Endpoint {
                    node: b,
                    interface: b_intf,
                    params: options.b,
                },
            ],
        });

        Ok(id)
    }

    /// Link every switch to the next one in creation order (s0-s1-...-sN)
    pub fn chain_switches(&mut self) -> Result<Vec<LinkId>> {
        let switches: Vec<NodeHandle> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Switch)
            .map(|(i, _)| NodeHandle(i))
            .collect();

        // All or nothing
        let mut created = Vec::new();
        for pair in switches.windows(2) {
            match self.add_link(pair[0], pair[1]) {
                Ok(id) => created.push(id),
                Err(e) => {
                    for id in created.into_iter().rev() {
                        let _ = self.remove_link(id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Remove a link, releasing both interfaces and their addresses
    pub fn remove_link(&mut self, id: LinkId) -> Result<Link> {
        let pos = self
            .links
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| Error::LinkEndpointInvalid(format!("{} does not exist", id)))?;
        let link = self.links.remove(pos);

        for endpoint in &link.endpoints {
            let node = &mut self.nodes[endpoint.node.0];
            let Some(idx) = node.interfaces.iter().position(|i| i.link == id) else {
                continue;
            };
            let intf = node.interfaces.remove(idx);
            match (intf.address, intf.origin) {
                (Some(_), Some(AddressOrigin::Declared)) => node.declared_in_use = false,
                (Some(addr), Some(_)) => self.allocator.release(&addr.addr()),
                _ => {}
            }
        }

        debug!(%id, "removed link");
        Ok(link)
    }

    fn check_endpoint(&self, handle: NodeHandle) -> Result<()> {
        if handle.0 >= self.nodes.len() {
            return Err(Error::LinkEndpointInvalid(format!(
                "node handle {} is not part of this topology",
                handle.0
            )));
        }
        Ok(())
    }

    /// Validate override keys and parse the `ip` override
    fn parse_params(&self, handle: NodeHandle, params: &EndpointParams) -> Result<Option<IpNet>> {
        let node = &self.nodes[handle.0];
        if let Some(key) = params
            .keys()
            .find(|k| !SUPPORTED_OPTIONS.contains(&k.as_str()))
        {
            return Err(Error::UnsupportedOption {
                endpoint: node.name.clone(),
                option: key.clone(),
            });
        }

        let Some(value) = params.get("ip") else {
            return Ok(None);
        };

        if !node.kind.is_host() {
            return Err(Error::UnsupportedOption {
                endpoint: node.name.clone(),
                option: "ip (switch ports are not addressed)".to_string(),
            });
        }

        self.allocator.parse(value).map(Some)
    }

    fn resolve_address(
        &self,
        handle: NodeHandle,
        intf: &str,
        explicit: Option<IpNet>,
    ) -> Result<Resolved> {
        let node = &self.nodes[handle.0];
        if !node.kind.is_host() {
            return Ok(Resolved {
                address: None,
                origin: None,
            });
        }

        if let Some(net) = explicit {
            self.allocator.reserve(net, intf)?;
            return Ok(Resolved {
                address: Some(net),
                origin: Some(AddressOrigin::Override),
            });
        }

        if let Some(declared) = node.declared
            && !node.declared_in_use
        {
            return Ok(Resolved {
                address: Some(declared),
                origin: Some(AddressOrigin::Declared),
            });
        }

        let net = self.allocator.allocate(intf)?;
        Ok(Resolved {
            address: Some(net),
            origin: Some(AddressOrigin::Allocated),
        })
    }

    /// Undo a resolution whose link was never committed
    fn unresolve(&self, res: &Resolved) {
        match (res.address, res.origin) {
            (Some(addr), Some(AddressOrigin::Allocated | AddressOrigin::Override)) => {
                self.allocator.release(&addr.addr())
            }
            _ => {}
        }
    }

    fn commit_interface(&mut self, handle: NodeHandle, name: &str, res: Resolved, link: LinkId) {
        let node = &mut self.nodes[handle.0];
        if res.origin == Some(AddressOrigin::Declared) {
            node.declared_in_use = true;
        }
        node.next_intf += 1;
        node.interfaces.push(Interface {
            name: name.to_string(),
            address: res.address,
            origin: res.origin,
            link,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> EndpointParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_interface_names_follow_count() {
        let mut topo = Topology::new();
        let s0 = topo.add_switch("s0").unwrap();
        let h0 = topo.add_host("h0").unwrap();
        let h1 = topo.add_host("h1").unwrap();

        topo.add_link(h0, s0).unwrap();
        topo.add_link(h1, s0).unwrap();
        topo.add_link(h0, h1).unwrap();

        let names: Vec<_> = topo.node(s0).interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["s0-eth0", "s0-eth1"]);
        let names: Vec<_> = topo.node(h0).interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["h0-eth0", "h0-eth1"]);
    }

    #[test]
    fn test_switch_ports_unaddressed() {
        let mut topo = Topology::new();
        let s0 = topo.add_switch("s0").unwrap();
        let h0 = topo.add_host("h0").unwrap();
        topo.add_link(h0, s0).unwrap();

        assert!(topo.node(s0).interfaces[0].address.is_none());
        assert_eq!(
            topo.node(h0).default_address(),
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_override_applies_to_endpoint() {
        let mut topo = Topology::new();
        let d1 = topo.add_container("d1", "ubuntu", None).unwrap();
        let s1 = topo.add_switch("s1").unwrap();
        let s2 = topo.add_switch("s2").unwrap();

        topo.add_link(d1, s1).unwrap();
        topo.add_link_with(d1, s2, LinkOptions::new().a_ip("11.0.0.1/8"))
            .unwrap();

        let node = topo.node(d1);
        assert_eq!(node.interfaces[0].address.unwrap().to_string(), "10.0.0.1/8");
        assert_eq!(node.interfaces[1].address.unwrap().to_string(), "11.0.0.1/8");
        assert_eq!(node.interfaces[1].origin, Some(AddressOrigin::Override));
    }

    #[test]
    fn test_duplicate_override_conflicts_before_start() {
        let mut topo = Topology::new();
        let d1 = topo.add_container("d1", "ubuntu", None).unwrap();
        let d2 = topo.add_container("d2", "ubuntu", None).unwrap();
        let s2 = topo.add_switch("s2").unwrap();

        topo.add_link_with(d1, s2, LinkOptions::new().a_ip("11.0.0.1/8"))
            .unwrap();
        let err = topo
            .add_link_with(d2, s2, LinkOptions::new().a_ip("11.0.0.1/8"))
            .unwrap_err();

        assert!(matches!(err, Error::AddressConflict { .. }));
        // Failed link left nothing behind
        assert_eq!(topo.links().len(), 1);
        assert!(topo.node(d2).interfaces.is_empty());
        assert_eq!(topo.node(s2).interfaces.len(), 1);
    }

    #[test]
    fn test_conflict_on_second_endpoint_rolls_back_first() {
        let mut topo = Topology::new();
        let h0 = topo.add_host("h0").unwrap();
        let h1 = topo.add_host("h1").unwrap();
        let h2 = topo.add_host("h2").unwrap();
        topo.add_link_with(h0, h1, LinkOptions::new().a_ip("12.0.0.1/8"))
            .unwrap();

        let before = topo.allocator().assigned_count();
        let opts = LinkOptions::new().a_ip("12.0.0.9/8").b_ip("12.0.0.1/8");
        assert!(topo.add_link_with(h2, h1, opts).is_err());

        assert_eq!(topo.allocator().assigned_count(), before);
        assert!(topo.allocator().owner_of(&"12.0.0.9".parse().unwrap()).is_none());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut topo = Topology::new();
        let h0 = topo.add_host("h0").unwrap();
        let h1 = topo.add_host("h1").unwrap();

        let opts = LinkOptions {
            a: params(&[("bw", "10")]),
            b: EndpointParams::new(),
        };
        let err = topo.add_link_with(h0, h1, opts).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOption { option, .. } if option == "bw"));
    }

    #[test]
    fn test_ip_on_switch_rejected() {
        let mut topo = Topology::new();
        let h0 = topo.add_host("h0").unwrap();
        let s0 = topo.add_switch("s0").unwrap();

        let err = topo
            .add_link_with(h0, s0, LinkOptions::new().b_ip("10.9.0.1/8"))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOption { .. }));
    }

    #[test]
    fn test_invalid_endpoints() {
        let mut topo = Topology::new();
        let h0 = topo.add_host("h0").unwrap();

        assert!(matches!(
            topo.add_link(h0, h0),
            Err(Error::LinkEndpointInvalid(_))
        ));
        assert!(matches!(
            topo.add_link(h0, NodeHandle(42)),
            Err(Error::LinkEndpointInvalid(_))
        ));
    }

    #[test]
    fn test_declared_address_used_by_first_default_interface() {
        let mut topo = Topology::new();
        let d2 = topo
            .add_container("d2", "ubuntu", Some("11.0.0.2"))
            .unwrap();
        let s1 = topo.add_switch("s1").unwrap();
        let s2 = topo.add_switch("s2").unwrap();

        topo.add_link(d2, s2).unwrap();
        topo.add_link(d2, s1).unwrap();

        let node = topo.node(d2);
        assert_eq!(node.interfaces[0].address.unwrap().to_string(), "11.0.0.2/8");
        assert_eq!(node.interfaces[0].origin, Some(AddressOrigin::Declared));
        assert_eq!(node.interfaces[1].origin, Some(AddressOrigin::Allocated));
    }

    #[test]
    fn test_remove_link_releases_and_keeps_names_unique() {
        let mut topo = Topology::new();
        let h0 = topo.add_host("h0").unwrap();
        let h1 = topo.add_host("h1").unwrap();
        let h2 = topo.add_host("h2").unwrap();

        let first = topo.add_link(h0, h1).unwrap();
        topo.add_link(h0, h2).unwrap();
        let assigned = topo.allocator().assigned_count();

        let removed = topo.remove_link(first).unwrap();
        assert_eq!(removed.endpoints[0].interface, "h0-eth0");
        assert_eq!(topo.allocator().assigned_count(), assigned - 2);

        topo.add_link(h0, h1).unwrap();
        let names: Vec<_> = topo.node(h0).interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["h0-eth1", "h0-eth2"]);

        assert!(topo.remove_link(first).is_err());
    }

    #[test]
    fn test_remove_link_returns_declared_address() {
        let mut topo = Topology::new();
        let d0 = topo.add_container("d0", "ubuntu", Some("11.0.0.2/8")).unwrap();
        let s0 = topo.add_switch("s0").unwrap();

        let link = topo.add_link(d0, s0).unwrap();
        topo.remove_link(link).unwrap();
        // Still reserved for the node
        assert_eq!(
            topo.allocator().owner_of(&"11.0.0.2".parse().unwrap()).as_deref(),
            Some("d0")
        );

        topo.add_link(d0, s0).unwrap();
        assert_eq!(
            topo.node(d0).interfaces[0].address.unwrap().to_string(),
            "11.0.0.2/8"
        );
    }

    #[test]
    fn test_chain_switches() {
        let mut topo = Topology::new();
        for i in 0..3 {
            topo.add_switch(&format!("s{i}")).unwrap();
        }
        topo.add_host("h0").unwrap();

        let links = topo.chain_switches().unwrap();
        assert_eq!(links.len(), 2);
        let s1 = topo.handle("s1").unwrap();
        assert_eq!(topo.node(s1).interfaces.len(), 2);
    }

    #[test]
    fn test_chain_switches_is_atomic() {
        let mut topo = Topology::new();
        topo.add_switch("s0").unwrap();
        topo.add_switch("s1").unwrap();
        let full = topo.add_switch("swfull00").unwrap();
        let h0 = topo.add_host("h0").unwrap();
        for _ in 0..1000 {
            topo.add_link(h0, full).unwrap();
        }
        let before = topo.links().len();

        // s1-swfull00 needs "swfull00-eth1000", which is too long
        assert!(matches!(
            topo.chain_switches(),
            Err(Error::LinkEndpointInvalid(_))
        ));
        assert_eq!(topo.links().len(), before);
        for name in ["s0", "s1"] {
            assert!(topo.get(name).unwrap().interfaces.is_empty(), "{name}");
        }
    }

    #[test]
    fn test_interface_name_limit() {
        let mut topo = Topology::new();
        let a = topo.add_host("abcdefgh").unwrap();
        let s = topo.add_switch("s0").unwrap();
        for _ in 0..1000 {
            topo.add_link(a, s).unwrap();
        }
        // "abcdefgh-eth999" is exactly 15 characters
        assert_eq!(topo.node(a).interfaces[999].name, "abcdefgh-eth999");
        assert!(matches!(
            topo.add_link(a, s),
            Err(Error::LinkEndpointInvalid(_))
        ));
    }

    #[test]
    fn test_peer_of() {
        let mut topo = Topology::new();
        let h0 = topo.add_host("h0").unwrap();
        let h1 = topo.add_host("h1").unwrap();
        topo.add_link(h0, h1).unwrap();

        let link = &topo.links()[0];
        assert_eq!(link.peer_of(h0).unwrap().interface, "h1-eth0");
        assert_eq!(link.peer_of(h1).unwrap().node, h0);
    }
}
