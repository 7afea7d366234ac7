//! Cleanup of everything a run leaves behind
//!
//! `LifecycleManager::cleanup` is the exit path for every run, successful
//! or not. It stops the network if it is still up, then asks the container
//! runtime and the kernel directly for anything still carrying the run's
//! prefix and removes it. Calling it again after it finished is a no-op.

use crate::container::{retry_once, ContainerRuntime, ListFilter};
use crate::error::{Error, Result};
use crate::fabric::NetFabric;
use crate::runtime::{veth_temp_prefix, NetworkRuntime, NetworkState, RunPrefix, NAME_MARKER};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Failures collected while releasing resources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    failures: Vec<String>,
}

impl TeardownReport {
    pub fn record(&mut self, failure: impl Into<String>) {
        let failure = failure.into();
        warn!(%failure, "teardown step failed");
        self.failures.push(failure);
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialTeardownFailure(self.failures))
        }
    }
}

/// What a cleanup sweeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupScope {
    /// Resources of a single run
    Run(RunPrefix),
    /// Resources of every run on this host
    AllRuns,
}

impl CleanupScope {
    fn filter(&self) -> ListFilter {
        match self {
            CleanupScope::Run(prefix) => ListFilter::run(prefix.as_str()).include_stopped(),
            CleanupScope::AllRuns => ListFilter::all_runs(),
        }
    }

    fn owns_namespace(&self, name: &str) -> bool {
        match self {
            CleanupScope::Run(prefix) => prefix.owns_namespace(name),
            CleanupScope::AllRuns => name.starts_with(&format!("{}-", NAME_MARKER)),
        }
    }

    fn owns_interface(&self, name: &str) -> bool {
        match self {
            CleanupScope::Run(prefix) => prefix.owns_interface(name),
            CleanupScope::AllRuns => veth_temp_prefix(name).is_some(),
        }
    }
}

/// Removes leftovers of a run, or of every run
pub struct LifecycleManager {
    fabric: Arc<dyn NetFabric>,
    containers: Arc<dyn ContainerRuntime>,
    scope: CleanupScope,
    /// Serializes concurrent cleanups
    lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        fabric: Arc<dyn NetFabric>,
        containers: Arc<dyn ContainerRuntime>,
        scope: CleanupScope,
    ) -> Self {
        Self {
            fabric,
            containers,
            scope,
            lock: Mutex::new(()),
        }
    }

    /// Manager for the run a runtime belongs to
    pub fn for_runtime(
        runtime: &NetworkRuntime,
        fabric: Arc<dyn NetFabric>,
        containers: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self::new(
            fabric,
            containers,
            CleanupScope::Run(runtime.prefix().clone()),
        )
    }

    pub fn scope(&self) -> &CleanupScope {
        &self.scope
    }

    /// Stop `runtime` if needed, then remove every remaining container and
    /// namespace in scope.
    ///
    /// Every step is attempted even when earlier ones fail.
    pub fn cleanup(&self, runtime: Option<&NetworkRuntime>) -> TeardownReport {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut report = TeardownReport::default();

        if let Some(runtime) = runtime
            && runtime.state() != NetworkState::Stopped
        {
            report.merge(runtime.stop());
        }

        match self.containers.list_instances(&self.scope.filter()) {
            Ok(ids) => {
                for id in ids {
                    match retry_once(&format!("remove {}", id), || {
                        self.containers.remove_instance(&id, true)
                    }) {
                        Ok(()) => info!(id = %id, "removed leftover container"),
                        Err(e) => report.record(format!("container {}: {}", id, e)),
                    }
                }
            }
            Err(e) => report.record(format!("listing containers: {}", e)),
        }

        // Veth pairs created but never moved out of the root namespace
        match self.fabric.list_interfaces(None) {
            Ok(names) => {
                for name in names.iter().filter(|n| self.scope.owns_interface(n)) {
                    match self.fabric.delete_interface(None, name) {
                        Ok(()) => info!(ifname = %name, "removed leftover interface"),
                        Err(e) => report.record(format!("interface {}: {}", name, e)),
                    }
                }
            }
            Err(e) => report.record(format!("listing interfaces: {}", e)),
        }

        match self.fabric.list_namespaces() {
            Ok(names) => {
                for name in names.iter().filter(|n| self.scope.owns_namespace(n)) {
                    match self.fabric.delete_namespace(name) {
                        Ok(()) => info!(ns = %name, "removed leftover namespace"),
                        Err(e) => report.record(format!("namespace {}: {}", name, e)),
                    }
                }
            }
            Err(e) => report.record(format!("listing namespaces: {}", e)),
        }

        debug!(failures = report.len(), "cleanup finished");
        report
    }

    /// Guard that runs `cleanup` when dropped
    pub fn guard<'a>(&'a self, runtime: &'a NetworkRuntime) -> CleanupGuard<'a> {
        CleanupGuard {
            manager: self,
            runtime,
        }
    }
}

/// Runs cleanup on every exit path out of a scope
pub struct CleanupGuard<'a> {
    manager: &'a LifecycleManager,
    runtime: &'a NetworkRuntime,
}

impl CleanupGuard<'_> {
    /// Clean up now and report the result
    pub fn finish(self) -> TeardownReport {
        let report = self.manager.cleanup(Some(self.runtime));
        std::mem::forget(self);
        report
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        let report = self.manager.cleanup(Some(self.runtime));
        if !report.is_clean() {
            warn!(failures = report.len(), "cleanup on drop left resources behind");
        }
    }
}
