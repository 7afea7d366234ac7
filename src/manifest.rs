//! Topology manifest parsing for fleetnet
//!
//! Parses `fleetnet.toml` files using serde and turns them into a
//! [`Topology`]. Nothing here touches the kernel.

use crate::address::{AddressAllocator, DEFAULT_IP_BASE};
use crate::container::docker::DEFAULT_DOCKER_HOST;
use crate::error::{Error, Result};
use crate::probe::DEFAULT_PROBE_PARALLELISM;
use crate::runtime::RunPrefix;
use crate::topology::{EndpointParams, LinkOptions, Topology};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Manifest file looked up when none is given
pub const DEFAULT_MANIFEST: &str = "fleetnet.toml";

/// Load a manifest from a file and validate it
pub fn load(path: &Path) -> Result<Manifest> {
    let manifest = read(path)?;
    manifest.validate()?;
    Ok(manifest)
}

/// Load and merge several manifests.
///
/// Later files override settings they specify and replace nodes with the
/// same name. Links always append.
pub fn load_merged(paths: &[PathBuf]) -> Result<Manifest> {
    let Some((first, rest)) = paths.split_first() else {
        return Err(Error::ConfigValidation("No manifest files provided".into()));
    };

    let mut manifest = read(first)?;
    for path in rest {
        manifest = manifest.merge(read(path)?);
    }
    manifest.validate()?;
    Ok(manifest)
}

fn read(path: &Path) -> Result<Manifest> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Root manifest structure
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    /// Run-wide settings
    #[serde(default)]
    pub settings: Settings,

    /// Process-backed hosts
    #[serde(default)]
    pub hosts: Vec<HostDef>,

    #[serde(default)]
    pub switches: Vec<SwitchDef>,

    /// Container-backed hosts
    #[serde(default)]
    pub containers: Vec<ContainerDef>,

    #[serde(default)]
    pub links: Vec<LinkDef>,
}

impl Manifest {
    /// Every node name, in creation order (switches, hosts, containers)
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.switches
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.hosts.iter().map(|h| h.name.as_str()))
            .chain(self.containers.iter().map(|c| c.name.as_str()))
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for name in self.node_names() {
            if !names.insert(name) {
                return Err(Error::DuplicateNode(name.to_string()));
            }
        }

        for link in &self.links {
            for end in [&link.a, &link.b] {
                if !names.contains(end.as_str()) {
                    return Err(Error::LinkEndpointInvalid(format!(
                        "link {}-{} references unknown node '{}'",
                        link.a, link.b, end
                    )));
                }
            }
        }

        self.settings.validate()
    }

    /// Build the topology this manifest describes
    pub fn build_topology(&self) -> Result<Topology> {
        let allocator = AddressAllocator::from_cidr(&self.settings.ip_base)?;
        let mut topology = Topology::with_allocator(allocator);

        for switch in &self.switches {
            topology.add_switch(&switch.name)?;
        }
        for host in &self.hosts {
            match &host.ip {
                Some(ip) => topology.add_host_with_ip(&host.name, ip)?,
                None => topology.add_host(&host.name)?,
            };
        }
        for container in &self.containers {
            let image = container
                .image
                .as_deref()
                .unwrap_or(&self.settings.default_image);
            topology.add_container(&container.name, image, container.ip.as_deref())?;
        }

        if self.settings.autolink_switches {
            topology.chain_switches()?;
        }

        for link in &self.links {
            let a = topology.require(&link.a)?;
            let b = topology.require(&link.b)?;
            let options = LinkOptions {
                a: link.a_params.clone(),
                b: link.b_params.clone(),
            };
            topology.add_link_with(a, b, options)?;
        }

        Ok(topology)
    }

    /// Merge another manifest into this one
    pub fn merge(mut self, other: Manifest) -> Manifest {
        self.settings = self.settings.merge(other.settings);

        for host in other.hosts {
            match self.hosts.iter_mut().find(|h| h.name == host.name) {
                Some(existing) => *existing = host,
                None => self.hosts.push(host),
            }
        }
        for switch in other.switches {
            if !self.switches.iter().any(|s| s.name == switch.name) {
                self.switches.push(switch);
            }
        }
        for container in other.containers {
            match self.containers.iter_mut().find(|c| c.name == container.name) {
                Some(existing) => *existing = container,
                None => self.containers.push(container),
            }
        }
        // Parallel links between the same pair are kept
        self.links.extend(other.links);

        self
    }
}

fn default_ip_base() -> String {
    DEFAULT_IP_BASE.into()
}

fn default_probe_timeout_secs() -> u64 {
    1
}

fn default_probe_parallelism() -> usize {
    DEFAULT_PROBE_PARALLELISM
}

fn default_docker_host() -> String {
    DEFAULT_DOCKER_HOST.into()
}

fn default_image() -> String {
    "ubuntu".into()
}

/// Run-wide settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Prefix for namespaces, containers and labels.
    /// If not set, one is derived from the process id.
    pub run_prefix: Option<String>,

    /// Base network for default addresses
    #[serde(default = "default_ip_base")]
    pub ip_base: String,

    /// Seconds to wait for each echo reply
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Probes in flight at once
    #[serde(default = "default_probe_parallelism")]
    pub probe_parallelism: usize,

    /// Container runtime endpoint
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// Image for containers that do not name one
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Link consecutive switches in declaration order
    #[serde(default)]
    pub autolink_switches: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_prefix: None,
            ip_base: default_ip_base(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_parallelism: default_probe_parallelism(),
            docker_host: default_docker_host(),
            default_image: default_image(),
            autolink_switches: false,
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<()> {
        AddressAllocator::from_cidr(&self.ip_base)?;
        if let Some(prefix) = &self.run_prefix {
            RunPrefix::new(prefix)?;
        }
        if self.probe_timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "probe_timeout_secs must be at least 1".into(),
            ));
        }
        if self.probe_parallelism == 0 {
            return Err(Error::ConfigValidation(
                "probe_parallelism must be at least 1".into(),
            ));
        }
        if self.default_image.trim().is_empty() {
            return Err(Error::ConfigValidation("default_image is empty".into()));
        }
        Ok(())
    }

    /// The configured run prefix, or a fresh one
    pub fn prefix(&self) -> Result<RunPrefix> {
        match &self.run_prefix {
            Some(prefix) => RunPrefix::new(prefix),
            None => Ok(RunPrefix::generate()),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Other's values override self's where they differ from the defaults
    fn merge(self, other: Settings) -> Settings {
        Settings {
            run_prefix: other.run_prefix.or(self.run_prefix),
            ip_base: if other.ip_base != default_ip_base() { other.ip_base } else { self.ip_base },
            probe_timeout_secs: if other.probe_timeout_secs != default_probe_timeout_secs() { other.probe_timeout_secs } else { self.probe_timeout_secs },
            probe_parallelism: if other.probe_parallelism != default_probe_parallelism() { other.probe_parallelism } else { self.probe_parallelism },
            docker_host: if other.docker_host != default_docker_host() { other.docker_host } else { self.docker_host },
            default_image: if other.default_image != default_image() { other.default_image } else { self.default_image },
            autolink_switches: other.autolink_switches || self.autolink_switches,
        }
    }
}

/// Process-backed host definition
#[derive(Debug, Clone, Deserialize)]
pub struct HostDef {
    pub name: String,
    /// Address for the host's first interface ("addr/len")
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchDef {
    pub name: String,
}

/// Container-backed host definition
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerDef {
    pub name: String,
    /// Image reference (defaults to `settings.default_image`)
    pub image: Option<String>,
    pub ip: Option<String>,
}

/// Link definition
#[derive(Debug, Clone, Deserialize)]
pub struct LinkDef {
    pub a: String,
    pub b: String,
    /// Overrides for the `a` endpoint (only `ip` is accepted)
    #[serde(default)]
    pub a_params: EndpointParams,
    #[serde(default)]
    pub b_params: EndpointParams,
}
