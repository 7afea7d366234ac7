//! `NetFabric` backed by iproute2, nsenter and ping
//!
//! Named namespaces are entered with `ip netns exec`, container namespaces
//! with `nsenter -t <pid> -n`.

use super::{NetFabric, NetnsRef};
use crate::error::{Error, Result};
use ipnet::IpNet;
use std::io::Read;
use std::net::IpAddr;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Polling interval while waiting on a probe child
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Extra time granted to a ping child beyond its own deadline
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// iproute2-based fabric
#[derive(Debug, Clone, Default)]
pub struct IpRoute {
    /// Prefix every command with `sudo`
    sudo: bool,
}

impl IpRoute {
    /// Fabric that runs commands directly (caller is root)
    pub fn new() -> Self {
        Self::default()
    }

    /// Fabric that runs every command through `sudo`
    pub fn with_sudo() -> Self {
        Self { sudo: true }
    }

    fn command(&self, args: &[String]) -> Command {
        let (program, rest) = if self.sudo {
            ("sudo", args)
        } else {
            (args[0].as_str(), &args[1..])
        };
        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd
    }

    /// Run a command, returning raw output
    fn run(&self, args: &[String]) -> Result<Output> {
        trace!(command = %args.join(" "), "exec");
        self.command(args).output().map_err(|e| Error::CommandFailed {
            command: args.join(" "),
            message: e.to_string(),
        })
    }

    /// Run a command, failing with its stderr on non-zero exit
    fn run_checked(&self, args: &[String]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Like `run_checked`, but treat "does not exist" style errors as success
    fn run_absent_ok(&self, args: &[String]) -> Result<()> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_absent(&stderr) {
            debug!(command = %args.join(" "), "target already gone");
            return Ok(());
        }
        Err(Error::CommandFailed {
            command: args.join(" "),
            message: stderr.trim().to_string(),
        })
    }
}

/// Build `args` so that they execute inside `ns`
fn in_ns(ns: Option<&NetnsRef>, args: &[&str]) -> Vec<String> {
    let mut full: Vec<String> = match ns {
        None => Vec::new(),
        Some(NetnsRef::Named(name)) => vec!["ip".into(), "netns".into(), "exec".into(), name.clone()],
        Some(NetnsRef::Pid(pid)) => vec![
            "nsenter".into(),
            "-t".into(),
            pid.to_string(),
            "-n".into(),
        ],
    };
    full.extend(args.iter().map(|a| a.to_string()));
    full
}

/// Interface name from one line of `ip -o link show`
/// (`"7: fnabv3a@fnabv3b: <BROADCAST,...> ..."`)
fn parse_link_name(line: &str) -> Option<String> {
    let name = line.split(": ").nth(1)?;
    let name = name.split('@').next()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn is_absent(stderr: &str) -> bool {
    stderr.contains("Cannot find device")
        || stderr.contains("does not exist")
        || stderr.contains("No such file or directory")
}

/// Wait for a child with a hard deadline, killing it on expiry.
///
/// Returns `None` on timeout.
fn wait_bounded(mut child: std::process::Child, timeout: Duration) -> Result<Option<(bool, String)>> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stderr = String::new();
                if let Some(mut s) = child.stderr.take() {
                    s.read_to_string(&mut stderr).ok();
                }
                return Ok(Some((status.success(), stderr)));
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

impl NetFabric for IpRoute {
    fn create_namespace(&self, name: &str) -> Result<()> {
        self.run_checked(&in_ns(None, &["ip", "netns", "add", name]))?;
        self.run_checked(&in_ns(
            Some(&NetnsRef::Named(name.to_string())),
            &["ip", "link", "set", "lo", "up"],
        ))?;
        debug!(ns = name, "created network namespace");
        Ok(())
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        self.run_absent_ok(&in_ns(None, &["ip", "netns", "del", name]))?;
        debug!(ns = name, "deleted network namespace");
        Ok(())
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        let output = self.run_checked(&in_ns(None, &["ip", "netns", "list"]))?;
        // Lines look like "name (id: 3)" or just "name"
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    fn list_interfaces(&self, ns: Option<&NetnsRef>) -> Result<Vec<String>> {
        let output = self.run_checked(&in_ns(ns, &["ip", "-o", "link", "show"]))?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_link_name)
            .collect())
    }

    fn create_veth(&self, a: &str, b: &str) -> Result<()> {
        self.run_checked(&in_ns(
            None,
            &["ip", "link", "add", a, "type", "veth", "peer", "name", b],
        ))?;
        debug!(a, b, "created veth pair");
        Ok(())
    }

    fn move_interface(&self, ifname: &str, target: &NetnsRef, new_name: &str) -> Result<()> {
        let dest = match target {
            NetnsRef::Named(name) => name.clone(),
            NetnsRef::Pid(pid) => pid.to_string(),
        };
        self.run_checked(&in_ns(None, &["ip", "link", "set", ifname, "netns", &dest]))?;
        self.run_checked(&in_ns(
            Some(target),
            &["ip", "link", "set", ifname, "name", new_name],
        ))?;
        debug!(ifname, %target, new_name, "moved interface");
        Ok(())
    }

    fn set_address(&self, ns: &NetnsRef, ifname: &str, addr: &IpNet) -> Result<()> {
        let cidr = addr.to_string();
        self.run_checked(&in_ns(Some(ns), &["ip", "addr", "add", &cidr, "dev", ifname]))?;
        debug!(%ns, ifname, %addr, "assigned address");
        Ok(())
    }

    fn set_up(&self, ns: &NetnsRef, ifname: &str) -> Result<()> {
        self.run_checked(&in_ns(Some(ns), &["ip", "link", "set", ifname, "up"]))?;
        Ok(())
    }

    fn create_bridge(&self, ns: &NetnsRef, bridge: &str) -> Result<()> {
        self.run_checked(&in_ns(
            Some(ns),
            &["ip", "link", "add", "name", bridge, "type", "bridge"],
        ))?;
        self.set_up(ns, bridge)?;
        debug!(%ns, bridge, "created bridge");
        Ok(())
    }

    fn attach_to_bridge(&self, ns: &NetnsRef, ifname: &str, bridge: &str) -> Result<()> {
        self.run_checked(&in_ns(
            Some(ns),
            &["ip", "link", "set", ifname, "master", bridge],
        ))?;
        Ok(())
    }

    fn delete_interface(&self, ns: Option<&NetnsRef>, ifname: &str) -> Result<()> {
        self.run_absent_ok(&in_ns(ns, &["ip", "link", "del", ifname]))?;
        debug!(ifname, "deleted interface");
        Ok(())
    }

    fn ping(&self, from: &NetnsRef, dst: IpAddr, timeout: Duration) -> Result<bool> {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let target = dst.to_string();
        let args = in_ns(Some(from), &["ping", "-n", "-c", "1", "-W", &wait_secs, &target]);

        let child = self
            .command(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: args.join(" "),
                message: e.to_string(),
            })?;

        match wait_bounded(child, timeout + PROBE_GRACE)? {
            Some((reached, stderr)) => {
                if !reached && !stderr.trim().is_empty() {
                    debug!(%from, %dst, stderr = %stderr.trim(), "probe failed");
                }
                Ok(reached)
            }
            None => {
                debug!(%from, %dst, "probe timed out");
                Ok(false)
            }
        }
    }
}
