//! Command-line interface for fleetnet
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use fleetnet::manifest::DEFAULT_MANIFEST;
use std::net::IpAddr;
use std::path::PathBuf;

/// fleetnet - emulated networks of namespace hosts, bridges and containers
#[derive(Parser)]
#[command(name = "fleetnet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Manifest file path (repeat to layer overrides)
    #[arg(short, long, default_value = DEFAULT_MANIFEST, global = true)]
    pub config: Vec<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run kernel commands through sudo instead of requiring root
    #[arg(long, global = true)]
    pub sudo: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate the manifest and show the resulting topology
    Check {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start the network, probe every host pair, then tear it down
    Run {
        /// Output the probe report in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start the network, probe among selected hosts, then tear it down
    Ping {
        /// Hosts to probe from (and between, unless --dest is given)
        #[arg(required = true)]
        nodes: Vec<String>,

        /// Probe this address from every selected host instead
        #[arg(long)]
        dest: Option<IpAddr>,

        /// Output the probe report in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove namespaces and containers left behind by earlier runs
    Clean {
        /// Sweep every fleetnet run, not only the configured prefix
        #[arg(long)]
        all: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "fleetnet", &mut std::io::stdout());
    }
}
