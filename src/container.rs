//! Container runtime client abstraction
//!
//! Container hosts get their network stack from an instance managed by an
//! external runtime. The runtime owns the instance; fleetnet only creates,
//! inspects and removes it, and tags every instance with a run label so a
//! later cleanup can find leftovers.

pub mod docker;

pub use docker::DockerCli;

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Label key carrying the run prefix on every instance fleetnet creates
pub const RUN_LABEL: &str = "fleetnet.run";

/// Runtime-assigned instance identifier
pub type InstanceId = String;

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Instance name (unique on the runtime)
    pub name: String,
    /// Image reference
    pub image: String,
    /// Labels attached to the instance
    pub labels: BTreeMap<String, String>,
}

impl InstanceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Which instances a listing returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// `key` or `key=value` label selector
    pub label: Option<String>,
    /// Include instances that are not running
    pub include_stopped: bool,
}

impl ListFilter {
    /// Running instances of one run
    pub fn run(prefix: &str) -> Self {
        Self {
            label: Some(format!("{}={}", RUN_LABEL, prefix)),
            include_stopped: false,
        }
    }

    /// Every instance fleetnet ever labelled, in any state
    pub fn all_runs() -> Self {
        Self {
            label: Some(RUN_LABEL.to_string()),
            include_stopped: true,
        }
    }

    pub fn include_stopped(mut self) -> Self {
        self.include_stopped = true;
        self
    }
}

/// Client for an external container runtime
pub trait ContainerRuntime: Send + Sync {
    /// Identifiers of instances matching `filter`
    fn list_instances(&self, filter: &ListFilter) -> Result<BTreeSet<InstanceId>>;

    /// Launch an instance and return its identifier once it is running
    fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceId>;

    /// Remove an instance; an unknown instance is not an error
    fn remove_instance(&self, id: &str, force: bool) -> Result<()>;

    /// PID of the instance's init process (its network namespace anchor)
    fn instance_pid(&self, id: &str) -> Result<u32>;
}

/// Run a runtime call, retrying once on failure.
///
/// Runtime errors are surfaced as `Error::Runtime` after the second attempt.
pub fn retry_once<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(what, error = %first, "runtime call failed, retrying once");
            op().map_err(|second| match second {
                Error::Runtime(_) => second,
                other => Error::Runtime(format!("{}: {}", what, other)),
            })
        }
    }
}
