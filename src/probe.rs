//! Connectivity probing
//!
//! Sends one echo request per (source, destination) pair from inside the
//! source's namespace and reports the fraction lost. Probes run in
//! parallel batches, and every batch has a hard deadline: a probe that
//! has not answered by then counts as lost.

use crate::error::{Error, Result};
use crate::runtime::{NetworkRuntime, NetworkState};
use crate::topology::NodeHandle;
use crossbeam::channel;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default wait for a single echo reply
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of probes in flight
pub const DEFAULT_PROBE_PARALLELISM: usize = 8;

/// Slack on top of the probe timeout before a batch is abandoned
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// How one probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    Reached,
    Lost,
    TimedOut,
    /// Destination node has no address to probe
    NoAddress,
    /// The probe could not be sent
    Error,
}

/// Outcome of a single probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub source: String,
    /// Destination node name, or the address for manual probes
    pub target: String,
    pub address: Option<IpAddr>,
    pub result: ProbeResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeOutcome {
    pub fn reached(&self) -> bool {
        self.result == ProbeResult::Reached
    }
}

/// Outcomes of one probe round, in probe order
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub outcomes: Vec<ProbeOutcome>,
}

impl ProbeReport {
    pub fn sent(&self) -> usize {
        self.outcomes.len()
    }

    pub fn received(&self) -> usize {
        self.outcomes.iter().filter(|o| o.reached()).count()
    }

    /// Fraction of probes lost, in [0, 1]; an empty round loses nothing
    pub fn loss(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = (self.sent() - self.received()) as f64;
        (lost / self.sent() as f64).clamp(0.0, 1.0)
    }

    pub fn lost(&self) -> impl Iterator<Item = &ProbeOutcome> {
        self.outcomes.iter().filter(|o| !o.reached())
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current: Option<&str> = None;
        for outcome in &self.outcomes {
            if current != Some(outcome.source.as_str()) {
                if current.is_some() {
                    writeln!(f)?;
                }
                write!(f, "{} ->", outcome.source)?;
                current = Some(outcome.source.as_str());
            }
            if outcome.reached() {
                write!(f, " {}", outcome.target)?;
            } else {
                write!(f, " X")?;
            }
        }
        if current.is_some() {
            writeln!(f)?;
        }
        write!(
            f,
            "Results: {:.0}% dropped ({}/{} received)",
            self.loss() * 100.0,
            self.received(),
            self.sent()
        )
    }
}

struct Probe {
    source: NodeHandle,
    target: String,
    address: Option<IpAddr>,
}

/// Probes a running network
pub struct ConnectivityProber<'a> {
    runtime: &'a NetworkRuntime,
    timeout: Duration,
    parallelism: usize,
}

impl<'a> ConnectivityProber<'a> {
    pub fn new(runtime: &'a NetworkRuntime) -> Self {
        Self {
            runtime,
            timeout: DEFAULT_PROBE_TIMEOUT,
            parallelism: DEFAULT_PROBE_PARALLELISM,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Probe every ordered pair of distinct hosts
    pub fn ping_all(&self) -> Result<ProbeReport> {
        self.ensure_running()?;
        let hosts: Vec<NodeHandle> = self.runtime.topology().hosts().map(|(h, _)| h).collect();
        Ok(self.execute(self.pairwise(&hosts)))
    }

    /// Probe among `nodes`, or from each of them to `manual_dest`
    pub fn ping(&self, nodes: &[NodeHandle], manual_dest: Option<IpAddr>) -> Result<ProbeReport> {
        self.ensure_running()?;
        let topology = self.runtime.topology();
        for &handle in nodes {
            if handle.index() >= topology.len() {
                return Err(Error::LinkEndpointInvalid(format!(
                    "node handle {} does not exist",
                    handle.index()
                )));
            }
            let node = topology.node(handle);
            if !node.kind.is_host() {
                return Err(Error::ConfigValidation(format!(
                    "'{}' is a switch and cannot send probes",
                    node.name
                )));
            }
        }

        let probes = match manual_dest {
            Some(dst) => nodes
                .iter()
                .map(|&source| Probe {
                    source,
                    target: dst.to_string(),
                    address: Some(dst),
                })
                .collect(),
            None => self.pairwise(nodes),
        };
        Ok(self.execute(probes))
    }

    fn ensure_running(&self) -> Result<()> {
        match self.runtime.state() {
            NetworkState::Running => Ok(()),
            other => Err(Error::NotRunning(other.to_string())),
        }
    }

    fn pairwise(&self, nodes: &[NodeHandle]) -> Vec<Probe> {
        let topology = self.runtime.topology();
        let mut probes = Vec::new();
        for &source in nodes {
            for &dest in nodes {
                if source == dest {
                    continue;
                }
                let node = topology.node(dest);
                probes.push(Probe {
                    source,
                    target: node.name.clone(),
                    address: node.default_address(),
                });
            }
        }
        probes
    }

    fn execute(&self, probes: Vec<Probe>) -> ProbeReport {
        let topology = self.runtime.topology();
        let mut outcomes: Vec<ProbeOutcome> = probes
            .iter()
            .map(|p| ProbeOutcome {
                source: topology.node(p.source).name.clone(),
                target: p.target.clone(),
                address: p.address,
                result: ProbeResult::TimedOut,
                detail: None,
            })
            .collect();

        let indices: Vec<usize> = (0..probes.len()).collect();
        for batch in indices.chunks(self.parallelism) {
            let (tx, rx) = channel::unbounded();
            let mut in_flight = 0;

            for &i in batch {
                let probe = &probes[i];
                let Some(dst) = probe.address else {
                    outcomes[i].result = ProbeResult::NoAddress;
                    continue;
                };
                let Some(ns) = self.runtime.netns_of(probe.source) else {
                    outcomes[i].result = ProbeResult::Error;
                    outcomes[i].detail = Some("source has no namespace".to_string());
                    continue;
                };

                let fabric = Arc::clone(self.runtime.fabric());
                let tx = tx.clone();
                let timeout = self.timeout;
                // Detached so a wedged probe cannot hold up the round
                thread::spawn(move || {
                    let _ = tx.send((i, fabric.ping(&ns, dst, timeout)));
                });
                in_flight += 1;
            }
            drop(tx);

            let deadline = Instant::now() + self.timeout + DEADLINE_GRACE;
            while in_flight > 0 {
                let Ok((i, result)) = rx.recv_deadline(deadline) else {
                    break;
                };
                in_flight -= 1;
                match result {
                    Ok(true) => outcomes[i].result = ProbeResult::Reached,
                    Ok(false) => outcomes[i].result = ProbeResult::Lost,
                    Err(e) => {
                        outcomes[i].result = ProbeResult::Error;
                        outcomes[i].detail = Some(e.to_string());
                    }
                }
            }
        }

        for outcome in outcomes.iter().filter(|o| !o.reached()) {
            debug!(
                source = %outcome.source,
                target = %outcome.target,
                result = ?outcome.result,
                "probe not answered"
            );
        }

        let report = ProbeReport { outcomes };
        info!(
            sent = report.sent(),
            received = report.received(),
            loss = report.loss(),
            "probe round finished"
        );
        report
    }
}
