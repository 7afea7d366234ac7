//! Host detection and prerequisite checks
//!
//! Everything fleetnet does to the kernel needs root, iproute2 and a kernel
//! recent enough to move veth ends into a process's network namespace.
//! These checks run before the first mutation so a missing piece fails
//! fast instead of halfway through a start.

use crate::error::{Error, Result};
use nix::sys::utsname::uname;
use nix::unistd::geteuid;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// Oldest kernel with `setns(2)` on network namespaces
const MIN_KERNEL: (u32, u32) = (3, 0);

/// Tools every run needs
pub const BASE_TOOLS: &[&str] = &["ip", "nsenter", "ping"];

/// Tool needed when the topology has container hosts
pub const CONTAINER_TOOL: &str = "docker";

/// Linux kernel version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Everything after the numeric part (e.g. "-fc-v139")
    pub suffix: String,
}

impl KernelVersion {
    /// Detect the running kernel version via `uname(2)`
    pub fn detect() -> Result<Self> {
        let info = uname().map_err(|e| Error::CommandFailed {
            command: "uname(2) syscall".to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&info.release().to_string_lossy())
    }

    /// Parse a release string such as "6.8.0-45-generic"
    fn parse(s: &str) -> Result<Self> {
        let numeric_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (numbers, suffix) = s.split_at(numeric_end);

        let mut parts = numbers.split('.').filter(|p| !p.is_empty());
        let mut next = |what: &str| -> Result<Option<u32>> {
            parts
                .next()
                .map(|p| {
                    p.parse::<u32>().map_err(|_| Error::CommandFailed {
                        command: "uname(2) syscall".to_string(),
                        message: format!("invalid {} version in '{}'", what, s),
                    })
                })
                .transpose()
        };

        let major = next("major")?.ok_or_else(|| Error::CommandFailed {
            command: "uname(2) syscall".to_string(),
            message: format!("invalid kernel release '{}'", s),
        })?;
        let minor = next("minor")?.unwrap_or(0);
        let patch = next("patch")?.unwrap_or(0);

        Ok(KernelVersion {
            major,
            minor,
            patch,
            suffix: suffix.to_string(),
        })
    }

    /// Whether veth ends can be moved into a pid's network namespace
    pub fn supports_netns(&self) -> bool {
        (self.major, self.minor) >= MIN_KERNEL
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}{}", self.major, self.minor, self.patch, self.suffix)
    }
}

/// Whether the process runs with an effective UID of 0
pub fn is_root() -> bool {
    geteuid().is_root()
}

/// Find an executable on `PATH`
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Fail unless the host can run a topology.
///
/// With `use_sudo` the root check is skipped and `sudo` must be present
/// instead.
pub fn check_prerequisites(needs_containers: bool, use_sudo: bool) -> Result<KernelVersion> {
    if use_sudo {
        if find_tool("sudo").is_none() {
            return Err(Error::ConfigValidation("sudo requested but not found on PATH".into()));
        }
    } else if !is_root() {
        return Err(Error::ConfigValidation(
            "fleetnet must run as root (or with --sudo)".into(),
        ));
    }

    let kernel = KernelVersion::detect()?;
    if !kernel.supports_netns() {
        return Err(Error::ConfigValidation(format!(
            "kernel {} is too old for network namespaces",
            kernel
        )));
    }

    let mut tools: Vec<&str> = BASE_TOOLS.to_vec();
    if needs_containers {
        tools.push(CONTAINER_TOOL);
    }
    let missing: Vec<&str> = tools.into_iter().filter(|t| find_tool(t).is_none()).collect();
    if !missing.is_empty() {
        return Err(Error::ConfigValidation(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        )));
    }

    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_distro_kernel() {
        let ver = KernelVersion::parse("6.8.0-45-generic").unwrap();
        assert_eq!((ver.major, ver.minor, ver.patch), (6, 8, 0));
        assert_eq!(ver.suffix, "-45-generic");
    }

    #[test]
    fn test_parse_short_release() {
        let ver = KernelVersion::parse("6.18").unwrap();
        assert_eq!((ver.major, ver.minor, ver.patch), (6, 18, 0));
        assert!(ver.suffix.is_empty());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(KernelVersion::parse("").is_err());
        assert!(KernelVersion::parse("linux").is_err());
    }

    #[test]
    fn test_netns_support() {
        assert!(KernelVersion::parse("6.18.44-fc-v139").unwrap().supports_netns());
        assert!(KernelVersion::parse("3.0.1").unwrap().supports_netns());
        assert!(!KernelVersion::parse("2.6.32-754.el6").unwrap().supports_netns());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            KernelVersion::parse("6.8.0-45-generic").unwrap().to_string(),
            "6.8.0-45-generic"
        );
    }

    #[test]
    fn test_detect_running_kernel() {
        let ver = KernelVersion::detect().unwrap();
        assert!(ver.major >= 2);
    }

    #[test]
    fn test_find_tool() {
        assert!(find_tool("sh").is_some());
        assert!(find_tool("definitely-not-a-real-tool-name").is_none());
    }
}
