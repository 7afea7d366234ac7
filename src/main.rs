//! fleetnet - network emulation core
//!
//! Builds a topology from a TOML manifest, realizes it with network
//! namespaces, veth pairs, bridges and containers, probes connectivity,
//! and removes everything again.

mod cli;

use cli::{Cli, Commands};
use fleetnet::container::{ContainerRuntime, DockerCli};
use fleetnet::error::{Error, Result};
use fleetnet::fabric::{IpRoute, NetFabric};
use fleetnet::lifecycle::{CleanupScope, LifecycleManager};
use fleetnet::manifest::{self, Manifest, Settings};
use fleetnet::probe::{ConnectivityProber, ProbeReport};
use fleetnet::runtime::NetworkRuntime;
use fleetnet::sys;
use fleetnet::topology::{NodeKind, Topology};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "fleetnet=debug" } else { "fleetnet=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(0)
        }
        Commands::Check { json } => {
            let manifest = manifest::load_merged(&cli.config)?;
            let topology = manifest.build_topology()?;
            print_topology(&topology, json)?;
            Ok(0)
        }
        Commands::Run { json } => {
            let manifest = manifest::load_merged(&cli.config)?;
            with_network(&manifest, cli.sudo, json, |_, prober| prober.ping_all())
        }
        Commands::Ping { nodes, dest, json } => {
            let manifest = manifest::load_merged(&cli.config)?;
            with_network(&manifest, cli.sudo, json, |runtime, prober| {
                let handles = nodes
                    .iter()
                    .map(|name| runtime.topology().require(name))
                    .collect::<Result<Vec<_>>>()?;
                prober.ping(&handles, dest)
            })
        }
        Commands::Clean { all } => {
            let settings = match manifest::load_merged(&cli.config) {
                Ok(manifest) => manifest.settings,
                Err(Error::ConfigRead { .. }) if all => Settings::default(),
                Err(e) => return Err(e),
            };
            clean(&settings, all, cli.sudo)
        }
    }
}

fn clients(settings: &Settings, use_sudo: bool) -> (Arc<dyn NetFabric>, Arc<dyn ContainerRuntime>) {
    let fabric: Arc<dyn NetFabric> = Arc::new(if use_sudo {
        IpRoute::with_sudo()
    } else {
        IpRoute::new()
    });
    let containers: Arc<dyn ContainerRuntime> =
        Arc::new(DockerCli::new(settings.docker_host.as_str()));
    (fabric, containers)
}

/// Start the network, probe it, and clean up on every exit path
fn with_network<F>(manifest: &Manifest, use_sudo: bool, json: bool, probe: F) -> Result<i32>
where
    F: FnOnce(&NetworkRuntime, &ConnectivityProber<'_>) -> Result<ProbeReport>,
{
    let topology = manifest.build_topology()?;
    let kernel = sys::check_prerequisites(topology.container_count() > 0, use_sudo)?;
    info!(%kernel, "prerequisites satisfied");

    let settings = &manifest.settings;
    let (fabric, containers) = clients(settings, use_sudo);
    let runtime = NetworkRuntime::new(
        topology,
        fabric.clone(),
        containers.clone(),
        settings.prefix()?,
    );
    let manager = LifecycleManager::for_runtime(&runtime, fabric, containers);
    let guard = manager.guard(&runtime);

    runtime.start()?;
    let mut counts_ok = check_container_count(&runtime, "after start");

    let prober = ConnectivityProber::new(&runtime)
        .with_timeout(settings.probe_timeout())
        .with_parallelism(settings.probe_parallelism);
    let report = probe(&runtime, &prober);
    counts_ok &= check_container_count(&runtime, "after probing");

    let teardown = guard.finish();
    let report = report?;
    print_report(&report, json)?;
    for failure in teardown.failures() {
        eprintln!("cleanup: {}", failure);
    }
    teardown.into_result()?;

    Ok(if report.loss() > 0.0 || !counts_ok { 1 } else { 0 })
}

/// Compare the runtime's own listing with the declared container hosts
fn check_container_count(runtime: &NetworkRuntime, when: &str) -> bool {
    let declared = runtime.topology().container_count();
    match runtime.live_containers() {
        Ok(live) if live == declared => true,
        Ok(live) => {
            warn!(live, declared, when, "runtime reports a different container count");
            false
        }
        Err(e) => {
            warn!(error = %e, when, "could not list containers");
            false
        }
    }
}

fn clean(settings: &Settings, all: bool, use_sudo: bool) -> Result<i32> {
    let scope = if all {
        CleanupScope::AllRuns
    } else {
        let prefix = settings.run_prefix.as_deref().ok_or_else(|| {
            Error::ConfigValidation(
                "set settings.run_prefix in the manifest or use --all".into(),
            )
        })?;
        CleanupScope::Run(fleetnet::runtime::RunPrefix::new(prefix)?)
    };

    sys::check_prerequisites(false, use_sudo)?;
    let (fabric, containers) = clients(settings, use_sudo);
    let report = LifecycleManager::new(fabric, containers, scope).cleanup(None);

    for failure in report.failures() {
        eprintln!("cleanup: {}", failure);
    }
    report.into_result()?;
    println!("Cleanup complete.");
    Ok(0)
}

fn print_report(report: &ProbeReport, json: bool) -> Result<()> {
    if json {
        let out = json!({
            "loss": report.loss(),
            "sent": report.sent(),
            "received": report.received(),
            "outcomes": &report.outcomes,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn print_topology(topology: &Topology, json: bool) -> Result<()> {
    if json {
        let nodes: Vec<_> = topology
            .nodes()
            .map(|(_, node)| {
                let image = match &node.kind {
                    NodeKind::ContainerHost { image } => Some(image.as_str()),
                    _ => None,
                };
                let interfaces: Vec<_> = node
                    .interfaces
                    .iter()
                    .map(|i| json!({ "name": i.name, "address": i.address.map(|a| a.to_string()) }))
                    .collect();
                json!({
                    "name": node.name,
                    "kind": node.kind.label(),
                    "image": image,
                    "interfaces": interfaces,
                })
            })
            .collect();
        let links: Vec<_> = topology
            .links()
            .iter()
            .map(|l| {
                json!({
                    "id": l.id.to_string(),
                    "a": l.endpoints[0].interface,
                    "b": l.endpoints[1].interface,
                })
            })
            .collect();
        let out = json!({
            "nodes": nodes,
            "links": links,
            "segments": topology.segments(),
            "full_mesh": topology.expected_full_mesh(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Nodes:");
    for (_, node) in topology.nodes() {
        println!("  {:<10} {}", node.name, node.kind);
        for intf in &node.interfaces {
            let address = intf
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("    {:<15} {}", intf.name, address);
        }
    }

    println!("Links:");
    for link in topology.links() {
        println!(
            "  {:<8} {} <-> {}",
            link.id.to_string(),
            link.endpoints[0].interface,
            link.endpoints[1].interface
        );
    }

    println!("Segments:");
    for (i, segment) in topology.segments().iter().enumerate() {
        let ports: Vec<String> = segment.iter().map(|(_, intf)| intf.clone()).collect();
        println!("  [{}] {}", i, ports.join(" "));
    }

    println!(
        "Full mesh reachable: {}",
        if topology.expected_full_mesh() { "yes" } else { "no" }
    );
    Ok(())
}
