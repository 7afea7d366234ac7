//! fleetnet - network emulation core
//!
//! Describes networks of process hosts, container hosts and switches joined
//! by point-to-point links, realizes them with Linux network namespaces,
//! veth pairs and bridges, and probes their connectivity.
//!
//! The usual flow:
//! 1. Build a [`topology::Topology`] (directly or from a [`manifest`])
//! 2. Hand it to a [`runtime::NetworkRuntime`] and `start()` it
//! 3. Probe with a [`probe::ConnectivityProber`]
//! 4. Tear down with [`lifecycle::LifecycleManager::cleanup`]

pub mod address;
pub mod container;
pub mod error;
pub mod fabric;
pub mod lifecycle;
pub mod manifest;
pub mod probe;
pub mod runtime;
pub mod sys;
pub mod topology;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
