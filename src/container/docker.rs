//! Docker CLI client
//!
//! Talks to the daemon through the `docker` binary with an explicit `-H`
//! host, so the same client works against local and remote daemons.

use super::{ContainerRuntime, InstanceId, InstanceSpec, ListFilter};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::process::{Command, Output};
use tracing::{debug, info};

/// Default daemon endpoint
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Command the instance runs so it stays alive with no workload
const IDLE_ENTRYPOINT: &str = "sleep";
const IDLE_ARG: &str = "infinity";

#[derive(Debug, Deserialize)]
struct Inspect {
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Pid")]
    pid: u32,
}

/// Docker runtime driven through its CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    host: String,
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DEFAULT_DOCKER_HOST)
    }
}

impl DockerCli {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            binary: "docker".to_string(),
        }
    }

    /// Daemon endpoint this client talks to
    pub fn host(&self) -> &str {
        &self.host
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new(&self.binary)
            .arg("-H")
            .arg(&self.host)
            .args(args)
            .output()
            .map_err(|e| Error::Runtime(format!("failed to execute {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Parse `docker ps -q` output into identifiers
fn parse_ids(stdout: &[u8]) -> BTreeSet<InstanceId> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract the init pid from `docker inspect` JSON
fn parse_pid(id: &str, stdout: &[u8]) -> Result<u32> {
    let entries: Vec<Inspect> = serde_json::from_slice(stdout)?;
    let entry = entries
        .first()
        .ok_or_else(|| Error::Runtime(format!("instance {} not found", id)))?;
    if !entry.state.running || entry.state.pid == 0 {
        return Err(Error::Runtime(format!("instance {} is not running", id)));
    }
    Ok(entry.state.pid)
}

impl ContainerRuntime for DockerCli {
    fn list_instances(&self, filter: &ListFilter) -> Result<BTreeSet<InstanceId>> {
        let selector = filter.label.as_ref().map(|l| format!("label={}", l));
        let mut args = vec!["ps", "-q", "--no-trunc"];
        if filter.include_stopped {
            args.push("-a");
        }
        if let Some(selector) = &selector {
            args.push("--filter");
            args.push(selector);
        }
        let output = self.run(&args)?;
        Ok(parse_ids(&output.stdout))
    }

    fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceId> {
        let labels: Vec<String> = spec
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut args = vec![
            "run",
            "-d",
            "--name",
            spec.name.as_str(),
            "--hostname",
            spec.name.as_str(),
            "--network",
            "none",
            "--entrypoint",
            IDLE_ENTRYPOINT,
        ];
        for label in &labels {
            args.push("--label");
            args.push(label);
        }
        args.push(spec.image.as_str());
        args.push(IDLE_ARG);

        let output = self.run(&args)?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(Error::Runtime(format!(
                "runtime returned no id for {}",
                spec.name
            )));
        }
        info!(name = %spec.name, image = %spec.image, id = %id, "created container");
        Ok(id)
    }

    fn remove_instance(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(id);
        match self.run(&args) {
            Ok(_) => {
                debug!(id, "removed container");
                Ok(())
            }
            Err(Error::CommandFailed { message, .. }) if message.contains("No such container") => {
                debug!(id, "container already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn instance_pid(&self, id: &str) -> Result<u32> {
        let output = self.run(&["inspect", id])?;
        parse_pid(id, &output.stdout)
    }
}
