//! In-memory fabric and container runtime for tests
//!
//! `FakeFabric` models namespaces, veth pairs, bridges and addresses well
//! enough to answer pings: the source picks its outgoing interface by
//! longest-prefix match and the request floods across veth peers and
//! bridge ports until it finds the destination address.

use crate::container::{ContainerRuntime, InstanceId, InstanceSpec, ListFilter, RUN_LABEL};
use crate::error::{Error, Result};
use crate::fabric::{NetFabric, NetnsRef};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
enum IfKind {
    Veth { peer: u64 },
    Bridge,
}

#[derive(Debug, Clone)]
struct FakeIf {
    /// `None` is the root namespace
    ns: Option<NetnsRef>,
    name: String,
    kind: IfKind,
    addrs: Vec<IpNet>,
    up: bool,
    master: Option<String>,
}

#[derive(Debug, Default)]
struct FabricState {
    namespaces: BTreeSet<String>,
    /// Interfaces keyed by creation sequence
    interfaces: BTreeMap<u64, FakeIf>,
    next_if: u64,
    calls: Vec<String>,
    failures: Vec<(String, String)>,
    dropped: HashSet<IpAddr>,
    hung: HashMap<IpAddr, Duration>,
}

impl FabricState {
    fn find(&self, ns: Option<&NetnsRef>, name: &str) -> Option<u64> {
        self.interfaces
            .iter()
            .find(|(_, i)| i.ns.as_ref() == ns && i.name == name)
            .map(|(id, _)| *id)
    }

    fn require(&self, ns: Option<&NetnsRef>, name: &str) -> Result<u64> {
        self.find(ns, name).ok_or_else(|| Error::CommandFailed {
            command: format!("ip link {}", name),
            message: format!("Cannot find device \"{}\"", name),
        })
    }

    fn ns_exists(&self, ns: &NetnsRef) -> bool {
        match ns {
            NetnsRef::Named(name) => self.namespaces.contains(name),
            NetnsRef::Pid(_) => true,
        }
    }

    fn remove_if(&mut self, id: u64) {
        let Some(removed) = self.interfaces.remove(&id) else {
            return;
        };
        match removed.kind {
            IfKind::Veth { peer } => {
                self.interfaces.remove(&peer);
            }
            IfKind::Bridge => {
                for intf in self.interfaces.values_mut() {
                    if intf.ns == removed.ns && intf.master.as_deref() == Some(removed.name.as_str()) {
                        intf.master = None;
                    }
                }
            }
        }
    }

    /// Flood from `start` across veth peers and bridges looking for `dst`
    fn l2_reaches(&self, start: u64, dst: &IpAddr) -> bool {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(id) = queue.pop_front() {
            let Some(intf) = self.interfaces.get(&id) else {
                continue;
            };
            if id != start && intf.addrs.iter().any(|a| a.addr() == *dst) {
                return true;
            }

            let mut next = Vec::new();
            if let IfKind::Veth { peer } = intf.kind {
                next.push(peer);
            }
            if let Some(bridge) = &intf.master {
                next.extend(
                    self.interfaces
                        .iter()
                        .filter(|(_, o)| o.ns == intf.ns && o.master.as_ref() == Some(bridge))
                        .map(|(oid, _)| *oid),
                );
            }

            for n in next {
                let usable = self.interfaces.get(&n).is_some_and(|o| o.up);
                if usable && seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        false
    }
}

/// Kernel stand-in
#[derive(Debug, Default)]
pub struct FakeFabric {
    state: Mutex<FabricState>,
}

impl FakeFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a call and fail it if a registered failure matches
    fn enter(&self, op: &str, args: &[&str]) -> Result<MutexGuard<'_, FabricState>> {
        let mut state = self.state();
        let call = if args.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, args.join(" "))
        };
        state.calls.push(call.clone());
        let injected = state
            .failures
            .iter()
            .any(|(fail_op, needle)| fail_op == op && call.contains(needle.as_str()));
        if injected {
            return Err(Error::CommandFailed {
                command: call,
                message: "injected failure".to_string(),
            });
        }
        Ok(state)
    }

    /// Fail every `op` call whose arguments contain `needle`
    pub fn fail_on(&self, op: &str, needle: &str) {
        self.state()
            .failures
            .push((op.to_string(), needle.to_string()));
    }

    /// Pings to `addr` get no reply
    pub fn drop_traffic_to(&self, addr: IpAddr) {
        self.state().dropped.insert(addr);
    }

    /// Pings to `addr` block for `delay` before answering
    pub fn hang_traffic_to(&self, addr: IpAddr, delay: Duration) {
        self.state().hung.insert(addr, delay);
    }

    /// Pre-existing namespace, as left by an earlier run
    pub fn add_namespace(&self, name: &str) {
        self.state().namespaces.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state().namespaces.iter().cloned().collect()
    }

    pub fn interface_count(&self) -> usize {
        self.state().interfaces.len()
    }

    pub fn addresses_of(&self, ns: &NetnsRef, ifname: &str) -> Vec<IpNet> {
        let state = self.state();
        state
            .find(Some(ns), ifname)
            .and_then(|id| state.interfaces.get(&id))
            .map(|i| i.addrs.clone())
            .unwrap_or_default()
    }
}

fn ns_label(ns: Option<&NetnsRef>) -> String {
    ns.map_or_else(|| "root".to_string(), |n| n.to_string())
}

impl NetFabric for FakeFabric {
    fn create_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.enter("create_namespace", &[name])?;
        if !state.namespaces.insert(name.to_string()) {
            return Err(Error::CommandFailed {
                command: format!("ip netns add {}", name),
                message: "File exists".to_string(),
            });
        }
        Ok(())
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.enter("delete_namespace", &[name])?;
        state.namespaces.remove(name);
        let inside: Vec<u64> = state
            .interfaces
            .iter()
            .filter(|(_, i)| i.ns == Some(NetnsRef::Named(name.to_string())))
            .map(|(id, _)| *id)
            .collect();
        for id in inside {
            state.remove_if(id);
        }
        Ok(())
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        let state = self.enter("list_namespaces", &[])?;
        Ok(state.namespaces.iter().cloned().collect())
    }

    fn list_interfaces(&self, ns: Option<&NetnsRef>) -> Result<Vec<String>> {
        let label = ns_label(ns);
        let state = self.enter("list_interfaces", &[&label])?;
        Ok(state
            .interfaces
            .values()
            .filter(|i| i.ns.as_ref() == ns)
            .map(|i| i.name.clone())
            .collect())
    }

    fn create_veth(&self, a: &str, b: &str) -> Result<()> {
        let mut state = self.enter("create_veth", &[a, b])?;
        if state.find(None, a).is_some() || state.find(None, b).is_some() {
            return Err(Error::CommandFailed {
                command: format!("ip link add {} type veth peer name {}", a, b),
                message: "File exists".to_string(),
            });
        }
        let (ida, idb) = (state.next_if, state.next_if + 1);
        state.next_if += 2;
        for (id, name, peer) in [(ida, a, idb), (idb, b, ida)] {
            state.interfaces.insert(
                id,
                FakeIf {
                    ns: None,
                    name: name.to_string(),
                    kind: IfKind::Veth { peer },
                    addrs: Vec::new(),
                    up: false,
                    master: None,
                },
            );
        }
        Ok(())
    }

    fn move_interface(&self, ifname: &str, target: &NetnsRef, new_name: &str) -> Result<()> {
        let label = target.to_string();
        let mut state = self.enter("move_interface", &[ifname, &label, new_name])?;
        let id = state.require(None, ifname)?;
        if !state.ns_exists(target) {
            return Err(Error::CommandFailed {
                command: format!("ip link set {} netns {}", ifname, label),
                message: "Invalid netns value".to_string(),
            });
        }
        if state.find(Some(target), new_name).is_some() {
            return Err(Error::CommandFailed {
                command: format!("ip link set {} name {}", ifname, new_name),
                message: "File exists".to_string(),
            });
        }
        if let Some(intf) = state.interfaces.get_mut(&id) {
            intf.ns = Some(target.clone());
            intf.name = new_name.to_string();
        }
        Ok(())
    }

    fn set_address(&self, ns: &NetnsRef, ifname: &str, addr: &IpNet) -> Result<()> {
        let (label, cidr) = (ns.to_string(), addr.to_string());
        let mut state = self.enter("set_address", &[&label, ifname, &cidr])?;
        let id = state.require(Some(ns), ifname)?;
        if let Some(intf) = state.interfaces.get_mut(&id) {
            intf.addrs.push(*addr);
        }
        Ok(())
    }

    fn set_up(&self, ns: &NetnsRef, ifname: &str) -> Result<()> {
        let label = ns.to_string();
        let mut state = self.enter("set_up", &[&label, ifname])?;
        let id = state.require(Some(ns), ifname)?;
        if let Some(intf) = state.interfaces.get_mut(&id) {
            intf.up = true;
        }
        Ok(())
    }

    fn create_bridge(&self, ns: &NetnsRef, bridge: &str) -> Result<()> {
        let label = ns.to_string();
        let mut state = self.enter("create_bridge", &[&label, bridge])?;
        if !state.ns_exists(ns) || state.find(Some(ns), bridge).is_some() {
            return Err(Error::CommandFailed {
                command: format!("ip link add name {} type bridge", bridge),
                message: format!("cannot create bridge in {}", label),
            });
        }
        let id = state.next_if;
        state.next_if += 1;
        state.interfaces.insert(
            id,
            FakeIf {
                ns: Some(ns.clone()),
                name: bridge.to_string(),
                kind: IfKind::Bridge,
                addrs: Vec::new(),
                up: true,
                master: None,
            },
        );
        Ok(())
    }

    fn attach_to_bridge(&self, ns: &NetnsRef, ifname: &str, bridge: &str) -> Result<()> {
        let label = ns.to_string();
        let mut state = self.enter("attach_to_bridge", &[&label, ifname, bridge])?;
        state.require(Some(ns), bridge)?;
        let id = state.require(Some(ns), ifname)?;
        if let Some(intf) = state.interfaces.get_mut(&id) {
            intf.master = Some(bridge.to_string());
        }
        Ok(())
    }

    fn delete_interface(&self, ns: Option<&NetnsRef>, ifname: &str) -> Result<()> {
        let label = ns_label(ns);
        let mut state = self.enter("delete_interface", &[&label, ifname])?;
        if let Some(id) = state.find(ns, ifname) {
            state.remove_if(id);
        }
        Ok(())
    }

    fn ping(&self, from: &NetnsRef, dst: IpAddr, _timeout: Duration) -> Result<bool> {
        let label = from.to_string();
        let target = dst.to_string();
        let state = self.enter("ping", &[&label, &target])?;

        if let Some(delay) = state.hung.get(&dst).copied() {
            drop(state);
            thread::sleep(delay);
            return Ok(true);
        }
        if !state.ns_exists(from) {
            return Err(Error::CommandFailed {
                command: format!("ping {}", dst),
                message: format!("namespace {} not found", label),
            });
        }
        if state.dropped.contains(&dst) {
            return Ok(false);
        }

        let local: Vec<(u64, &FakeIf)> = state
            .interfaces
            .iter()
            .filter(|(_, i)| i.ns.as_ref() == Some(from))
            .map(|(id, i)| (*id, i))
            .collect();
        if local.iter().any(|(_, i)| i.addrs.iter().any(|a| a.addr() == dst)) {
            return Ok(true);
        }

        let mut best: Option<(u64, u8)> = None;
        for (id, intf) in &local {
            if !intf.up {
                continue;
            }
            for net in intf.addrs.iter().filter(|n| n.contains(&dst)) {
                if best.is_none_or(|(_, len)| net.prefix_len() > len) {
                    best = Some((*id, net.prefix_len()));
                }
            }
        }

        Ok(best.is_some_and(|(out, _)| state.l2_reaches(out, &dst)))
    }
}

#[derive(Debug, Clone)]
struct FakeInstance {
    name: String,
    image: String,
    labels: BTreeMap<String, String>,
    running: bool,
    pid: u32,
}

#[derive(Debug, Default)]
struct RuntimeState {
    instances: BTreeMap<InstanceId, FakeInstance>,
    next_id: u32,
    failing_creates: usize,
    rejected_images: HashSet<String>,
    stuck: Vec<String>,
    remove_calls: usize,
}

/// Container runtime stand-in
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The next `n` create calls fail
    pub fn fail_next_creates(&self, n: usize) {
        self.state().failing_creates = n;
    }

    /// Creating from `image` always fails
    pub fn reject_image(&self, image: &str) {
        self.state().rejected_images.insert(image.to_string());
    }

    /// Removing instances whose name contains `needle` fails
    pub fn stick_removal(&self, needle: &str) {
        self.state().stuck.push(needle.to_string());
    }

    pub fn unstick_removals(&self) {
        self.state().stuck.clear();
    }

    /// Instance left behind by an earlier run
    pub fn add_orphan(&self, name: &str, run: &str) {
        let spec = InstanceSpec::new(name, "ubuntu").label(RUN_LABEL, run);
        let mut state = self.state();
        insert_instance(&mut state, &spec, false);
    }

    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }

    pub fn remove_calls(&self) -> usize {
        self.state().remove_calls
    }

    pub fn labels_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state()
            .instances
            .values()
            .find(|i| i.name == name)
            .map(|i| i.labels.clone())
    }
}

fn insert_instance(state: &mut RuntimeState, spec: &InstanceSpec, running: bool) -> InstanceId {
    state.next_id += 1;
    let id = format!("c{:08x}", state.next_id);
    state.instances.insert(
        id.clone(),
        FakeInstance {
            name: spec.name.clone(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            running,
            pid: 10_000 + state.next_id,
        },
    );
    id
}

fn label_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    match selector.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(selector),
    }
}

impl ContainerRuntime for FakeRuntime {
    fn list_instances(&self, filter: &ListFilter) -> Result<BTreeSet<InstanceId>> {
        Ok(self
            .state()
            .instances
            .iter()
            .filter(|(_, i)| filter.include_stopped || i.running)
            .filter(|(_, i)| {
                filter
                    .label
                    .as_deref()
                    .is_none_or(|sel| label_matches(&i.labels, sel))
            })
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceId> {
        let mut state = self.state();
        if state.rejected_images.contains(&spec.image) {
            return Err(Error::Runtime(format!("image {} not found", spec.image)));
        }
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(Error::Runtime("daemon busy".to_string()));
        }
        if state.instances.values().any(|i| i.name == spec.name) {
            return Err(Error::Runtime(format!("name {} already in use", spec.name)));
        }
        Ok(insert_instance(&mut state, spec, true))
    }

    fn remove_instance(&self, id: &str, _force: bool) -> Result<()> {
        let mut state = self.state();
        state.remove_calls += 1;
        let Some(instance) = state.instances.get(id) else {
            return Ok(());
        };
        if state.stuck.iter().any(|s| instance.name.contains(s.as_str())) {
            return Err(Error::Runtime(format!("{} is stuck", instance.name)));
        }
        state.instances.remove(id);
        Ok(())
    }

    fn instance_pid(&self, id: &str) -> Result<u32> {
        match self.state().instances.get(id) {
            Some(i) if i.running => Ok(i.pid),
            Some(i) => Err(Error::Runtime(format!("{} ({}) is not running", i.name, i.image))),
            None => Err(Error::Runtime(format!("no such instance {}", id))),
        }
    }
}
