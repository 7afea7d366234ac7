//! Network runtime
//!
//! Turns a [`Topology`] into live kernel objects and containers, and tears
//! them down again. Startup order:
//! 1. Namespace-backed nodes (hosts, switches) in creation order
//! 2. Container hosts, acquired in parallel batches
//! 3. Links in creation order
//!
//! Any failure rolls back everything acquired so far, in reverse, and
//! leaves the network `Failed`. Teardown releases links, then nodes, in
//! reverse creation order and never stops at the first error.

pub mod state;

pub use state::NetworkState;

use crate::container::{
    retry_once, ContainerRuntime, InstanceId, InstanceSpec, ListFilter, RUN_LABEL,
};
use crate::error::{Error, Result};
use crate::fabric::{NetFabric, NetnsRef, SWITCH_BRIDGE};
use crate::lifecycle::TeardownReport;
use crate::topology::{Link, LinkId, Node, NodeHandle, NodeKind, Topology};
use state::Lifecycle;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Marker leading every namespace and container name fleetnet creates
pub const NAME_MARKER: &str = "fln";

/// Label carrying the node name on container instances
pub const NODE_LABEL: &str = "fleetnet.node";

/// Maximum run prefix length (keeps temporary veth names inside IFNAMSIZ)
const MAX_PREFIX: usize = 8;

/// Default number of containers acquired concurrently
pub const DEFAULT_ACQUIRE_PARALLELISM: usize = 4;

/// Per-run name prefix.
///
/// Namespaces, container names, container labels and temporary veth names
/// all carry it, so one run never collides with another and cleanup can
/// find a run's leftovers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPrefix(String);

impl RunPrefix {
    pub fn new(prefix: &str) -> Result<Self> {
        let valid = !prefix.is_empty()
            && prefix.len() <= MAX_PREFIX
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !valid {
            return Err(Error::ConfigValidation(format!(
                "run prefix '{}' must be 1-{} characters of [a-z0-9]",
                prefix, MAX_PREFIX
            )));
        }
        Ok(Self(prefix.to_string()))
    }

    /// Prefix unique to this process
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Self(format!("fn{:06x}", (std::process::id() ^ nanos) & 0x00ff_ffff))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace name for a node
    pub fn namespace(&self, node: &str) -> String {
        format!("{}-{}-{}", NAME_MARKER, self.0, node)
    }

    /// Container name for a node
    pub fn container_name(&self, node: &str) -> String {
        self.namespace(node)
    }

    /// Whether a namespace name belongs to this run
    pub fn owns_namespace(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-{}-", NAME_MARKER, self.0))
    }

    /// Temporary root-namespace name for one side of a link's veth pair
    pub(crate) fn veth_temp(&self, link: LinkId, side: char) -> String {
        format!("{}v{}{}", self.0, link.0 % 100_000, side)
    }

    /// Whether a root-namespace interface is one of this run's temporary
    /// veth ends
    pub fn owns_interface(&self, name: &str) -> bool {
        veth_temp_prefix(name) == Some(self.as_str())
    }
}

/// Run prefix of a temporary veth name (`<prefix>v<link><a|b>`)
pub(crate) fn veth_temp_prefix(name: &str) -> Option<&str> {
    let rest = name.strip_suffix('a').or_else(|| name.strip_suffix('b'))?;
    let (prefix, link) = rest.rsplit_once('v')?;
    let link_ok = !link.is_empty() && link.len() <= 5 && link.chars().all(|c| c.is_ascii_digit());
    let prefix_ok = !prefix.is_empty()
        && prefix.len() <= MAX_PREFIX
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    (link_ok && prefix_ok).then_some(prefix)
}

impl fmt::Display for RunPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What backs a node while the network runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeHandle {
    /// Named network namespace (process hosts and switches)
    Namespace { name: String },
    /// Runtime-managed container and its init pid
    Container { id: InstanceId, pid: u32 },
}

impl RuntimeHandle {
    /// Namespace the node's interfaces live in
    pub fn netns(&self) -> NetnsRef {
        match self {
            RuntimeHandle::Namespace { name } => NetnsRef::Named(name.clone()),
            RuntimeHandle::Container { pid, .. } => NetnsRef::Pid(*pid),
        }
    }
}

#[derive(Debug, Default)]
struct Acquired {
    /// Node -> backing handle (ordered by creation)
    handles: BTreeMap<NodeHandle, RuntimeHandle>,
    /// Links materialized so far, in creation order
    links: Vec<LinkId>,
}

/// Live network built from a topology
pub struct NetworkRuntime {
    topology: Topology,
    fabric: Arc<dyn NetFabric>,
    containers: Arc<dyn ContainerRuntime>,
    prefix: RunPrefix,
    parallelism: usize,
    lifecycle: Mutex<Lifecycle>,
    acquired: Mutex<Acquired>,
}

impl NetworkRuntime {
    pub fn new(
        topology: Topology,
        fabric: Arc<dyn NetFabric>,
        containers: Arc<dyn ContainerRuntime>,
        prefix: RunPrefix,
    ) -> Self {
        Self {
            topology,
            fabric,
            containers,
            prefix,
            parallelism: DEFAULT_ACQUIRE_PARALLELISM,
            lifecycle: Mutex::new(Lifecycle::new()),
            acquired: Mutex::new(Acquired::default()),
        }
    }

    /// Set how many containers are acquired concurrently
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn acquired(&self) -> MutexGuard<'_, Acquired> {
        self.acquired.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> NetworkState {
        self.lifecycle().state()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn prefix(&self) -> &RunPrefix {
        &self.prefix
    }

    pub(crate) fn fabric(&self) -> &Arc<dyn NetFabric> {
        &self.fabric
    }

    /// Backing handle of a node, while it is acquired
    pub fn handle_of(&self, node: NodeHandle) -> Option<RuntimeHandle> {
        self.acquired().handles.get(&node).cloned()
    }

    /// Namespace of a node, while it is acquired
    pub fn netns_of(&self, node: NodeHandle) -> Option<NetnsRef> {
        self.acquired().handles.get(&node).map(RuntimeHandle::netns)
    }

    /// Runtime identifier of a container host
    pub fn container_id(&self, name: &str) -> Option<InstanceId> {
        let handle = self.topology.handle(name)?;
        match self.acquired().handles.get(&handle)? {
            RuntimeHandle::Container { id, .. } => Some(id.clone()),
            RuntimeHandle::Namespace { .. } => None,
        }
    }

    /// Running instances carrying this run's label, as the runtime reports them
    pub fn live_containers(&self) -> Result<usize> {
        Ok(self
            .containers
            .list_instances(&ListFilter::run(self.prefix.as_str()))?
            .len())
    }

    /// Materialize every node and link.
    ///
    /// On failure all partially acquired resources are released and the
    /// network ends in `Failed`.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        lifecycle.start()?;
        info!(
            prefix = %self.prefix,
            nodes = self.topology.len(),
            links = self.topology.links().len(),
            "starting network"
        );

        let mut acquired = self.acquired();
        match self.bring_up(&mut acquired) {
            Ok(()) => {
                lifecycle.started()?;
                info!(prefix = %self.prefix, "network running");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "start failed, rolling back");
                let report = self.release_all(&mut acquired);
                if !report.is_clean() {
                    warn!(failures = report.len(), "rollback left resources behind");
                }
                lifecycle.fail()?;
                Err(e)
            }
        }
    }

    /// Release every link and node.
    ///
    /// Always ends in `Stopped`; individual release failures are collected
    /// in the report. Stopping a stopped network is a no-op.
    pub fn stop(&self) -> TeardownReport {
        let mut lifecycle = self.lifecycle();
        let mut report = TeardownReport::default();

        match lifecycle.state() {
            NetworkState::Stopped => return report,
            NetworkState::Built => {
                if let Err(e) = lifecycle.abandon() {
                    report.record(e.to_string());
                }
                return report;
            }
            _ => {}
        }

        if let Err(e) = lifecycle.stop() {
            report.record(e.to_string());
            return report;
        }
        info!(prefix = %self.prefix, "stopping network");

        report.merge(self.release_all(&mut self.acquired()));

        if let Err(e) = lifecycle.stopped() {
            report.record(e.to_string());
        }
        info!(failures = report.len(), "network stopped");
        report
    }

    fn bring_up(&self, acquired: &mut Acquired) -> Result<()> {
        let mut pending = Vec::new();
        for (handle, node) in self.topology.nodes() {
            match &node.kind {
                NodeKind::ProcessHost => {
                    let name = self.prefix.namespace(&node.name);
                    self.fabric
                        .create_namespace(&name)
                        .map_err(|e| acquisition_error(&node.name, e))?;
                    acquired
                        .handles
                        .insert(handle, RuntimeHandle::Namespace { name });
                }
                NodeKind::Switch => {
                    let name = self.prefix.namespace(&node.name);
                    self.fabric
                        .create_namespace(&name)
                        .map_err(|e| acquisition_error(&node.name, e))?;
                    let ns = NetnsRef::Named(name.clone());
                    acquired
                        .handles
                        .insert(handle, RuntimeHandle::Namespace { name });
                    self.fabric
                        .create_bridge(&ns, SWITCH_BRIDGE)
                        .map_err(|e| acquisition_error(&node.name, e))?;
                }
                NodeKind::ContainerHost { image } => pending.push((handle, node, image.as_str())),
            }
            debug!(node = %node.name, kind = %node.kind, "acquired node");
        }

        self.acquire_containers(&pending, acquired)?;

        for link in self.topology.links() {
            self.materialize(acquired, link)?;
            acquired.links.push(link.id);
        }
        Ok(())
    }

    fn acquire_containers(
        &self,
        pending: &[(NodeHandle, &Node, &str)],
        acquired: &mut Acquired,
    ) -> Result<()> {
        let mut first_error = None;

        for batch in pending.chunks(self.parallelism) {
            let containers = self.containers.as_ref();
            let prefix = &self.prefix;

            let results = crossbeam::scope(|s| {
                let workers: Vec<_> = batch
                    .iter()
                    .map(|&(handle, node, image)| {
                        let worker =
                            s.spawn(move |_| acquire_container(containers, prefix, node, image));
                        (handle, worker)
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|(handle, worker)| {
                        let result = worker.join().unwrap_or_else(|_| {
                            Err(Error::Runtime("container acquisition panicked".to_string()))
                        });
                        (handle, result)
                    })
                    .collect::<Vec<_>>()
            })
            .map_err(|_| Error::Runtime("container acquisition panicked".to_string()))?;

            // Keep successes even on error so rollback can release them
            for (handle, result) in results {
                match result {
                    Ok(runtime_handle) => {
                        acquired.handles.insert(handle, runtime_handle);
                    }
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            if first_error.is_some() {
                break;
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn netns_in(&self, acquired: &Acquired, node: NodeHandle) -> Result<NetnsRef> {
        acquired
            .handles
            .get(&node)
            .map(RuntimeHandle::netns)
            .ok_or_else(|| {
                Error::Runtime(format!(
                    "node '{}' has no runtime handle",
                    self.topology.node(node).name
                ))
            })
    }

    fn describe_link(&self, link: &Link) -> String {
        let [a, b] = &link.endpoints;
        format!("{} ({}<->{})", link.id, a.interface, b.interface)
    }

    /// Create one veth pair, place both ends and configure them
    fn materialize(&self, acquired: &Acquired, link: &Link) -> Result<()> {
        let temp = [
            self.prefix.veth_temp(link.id, 'a'),
            self.prefix.veth_temp(link.id, 'b'),
        ];
        self.fabric
            .create_veth(&temp[0], &temp[1])
            .map_err(|e| acquisition_error(&self.describe_link(link), e))?;

        if let Err(e) = self.configure_link(acquired, link, &temp) {
            self.discard_link(acquired, link, &temp);
            return Err(acquisition_error(&self.describe_link(link), e));
        }
        debug!(link = %self.describe_link(link), "link up");
        Ok(())
    }

    fn configure_link(&self, acquired: &Acquired, link: &Link, temp: &[String; 2]) -> Result<()> {
        for (endpoint, temp_name) in link.endpoints.iter().zip(temp) {
            let ns = self.netns_in(acquired, endpoint.node)?;
            self.fabric
                .move_interface(temp_name, &ns, &endpoint.interface)?;

            let node = self.topology.node(endpoint.node);
            if node.kind.is_host() {
                let address = node
                    .interface(&endpoint.interface)
                    .and_then(|intf| intf.address);
                if let Some(address) = address {
                    self.fabric.set_address(&ns, &endpoint.interface, &address)?;
                }
            } else {
                self.fabric
                    .attach_to_bridge(&ns, &endpoint.interface, SWITCH_BRIDGE)?;
            }
            self.fabric.set_up(&ns, &endpoint.interface)?;
        }
        Ok(())
    }

    /// Best-effort removal of a half-configured veth pair
    fn discard_link(&self, acquired: &Acquired, link: &Link, temp: &[String; 2]) {
        for name in temp {
            let _ = self.fabric.delete_interface(None, name);
        }
        for endpoint in &link.endpoints {
            if let Ok(ns) = self.netns_in(acquired, endpoint.node) {
                let _ = self.fabric.delete_interface(Some(&ns), &endpoint.interface);
            }
        }
    }

    /// Release links then nodes, newest first
    fn release_all(&self, acquired: &mut Acquired) -> TeardownReport {
        let mut report = TeardownReport::default();

        while let Some(id) = acquired.links.pop() {
            let Some(link) = self.topology.links().iter().find(|l| l.id == id) else {
                continue;
            };
            // Deleting one end of a veth pair removes both
            let endpoint = &link.endpoints[0];
            let Some(handle) = acquired.handles.get(&endpoint.node) else {
                continue;
            };
            if let Err(e) = self
                .fabric
                .delete_interface(Some(&handle.netns()), &endpoint.interface)
            {
                report.record(format!("{}: {}", self.describe_link(link), e));
            }
        }

        let handles = std::mem::take(&mut acquired.handles);
        for (handle, runtime_handle) in handles.into_iter().rev() {
            let name = &self.topology.node(handle).name;
            let result = match &runtime_handle {
                RuntimeHandle::Namespace { name: ns } => self.fabric.delete_namespace(ns),
                RuntimeHandle::Container { id, .. } => {
                    retry_once(&format!("remove {}", name), || {
                        self.containers.remove_instance(id, true)
                    })
                }
            };
            match result {
                Ok(()) => debug!(node = %name, "released node"),
                Err(e) => report.record(format!("node '{}': {}", name, e)),
            }
        }

        report
    }
}

/// Create a container for `node` and resolve its namespace pid
fn acquire_container(
    containers: &dyn ContainerRuntime,
    prefix: &RunPrefix,
    node: &Node,
    image: &str,
) -> Result<RuntimeHandle> {
    let spec = InstanceSpec::new(prefix.container_name(&node.name), image)
        .label(RUN_LABEL, prefix.as_str())
        .label(NODE_LABEL, node.name.as_str());

    let id = retry_once(&format!("create {}", node.name), || {
        containers.create_instance(&spec)
    })
    .map_err(|e| acquisition_error(&node.name, e))?;

    match retry_once(&format!("inspect {}", node.name), || {
        containers.instance_pid(&id)
    }) {
        Ok(pid) => {
            debug!(node = %node.name, id = %id, pid, "container ready");
            Ok(RuntimeHandle::Container { id, pid })
        }
        Err(e) => {
            if let Err(rm) = containers.remove_instance(&id, true) {
                warn!(node = %node.name, error = %rm, "failed to remove unusable container");
            }
            Err(acquisition_error(&node.name, e))
        }
    }
}

fn acquisition_error(what: &str, err: Error) -> Error {
    match err {
        Error::AcquisitionFailed { .. } => err,
        other => Error::AcquisitionFailed {
            node: what.to_string(),
            message: other.to_string(),
        },
    }
}
