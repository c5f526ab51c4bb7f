//! Enumeration of attachable JVMs and the attach seam.
//!
//! [`AttachProvider`] is what discovery and injection talk to; the
//! [`HotSpotProvider`] implementation lists local JVMs with `sysinfo` and
//! the `hsperfdata_<user>` directories, and attaches through
//! [`VirtualMachine`].

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use sysinfo::System;
use tracing::debug;

use crate::error::Result;
use crate::scoring::Properties;
use crate::vm::{VirtualMachine, DEFAULT_ATTACH_TIMEOUT};

/// A local process that may be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmDescriptor {
    pub pid: u32,
    /// Command line without the executable.
    pub display_name: String,
}

/// An attach session with one JVM.
pub trait AttachedVm {
    fn properties(&self) -> Result<Properties>;

    fn load_agent(&self, jar: &Path, options: &str) -> Result<()>;

    fn detach(self: Box<Self>) -> Result<()>;
}

/// Lists and attaches to local JVMs.
pub trait AttachProvider: Send + Sync {
    fn list(&self) -> Vec<VmDescriptor>;

    fn attach(&self, pid: u32) -> Result<Box<dyn AttachedVm>>;
}

// ============================================================================
// HotSpot
// ============================================================================

impl AttachedVm for VirtualMachine {
    fn properties(&self) -> Result<Properties> {
        VirtualMachine::properties(self)
    }

    fn load_agent(&self, jar: &Path, options: &str) -> Result<()> {
        VirtualMachine::load_agent(self, jar, options)
    }

    fn detach(self: Box<Self>) -> Result<()> {
        VirtualMachine::detach(*self)
    }
}

/// Attaches to HotSpot JVMs on this machine.
#[derive(Debug, Clone)]
pub struct HotSpotProvider {
    attach_timeout: Duration,
}

impl HotSpotProvider {
    pub fn new() -> Self {
        Self::with_attach_timeout(DEFAULT_ATTACH_TIMEOUT)
    }

    pub fn with_attach_timeout(attach_timeout: Duration) -> Self {
        Self { attach_timeout }
    }
}

impl Default for HotSpotProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachProvider for HotSpotProvider {
    fn list(&self) -> Vec<VmDescriptor> {
        list_java_processes()
    }

    fn attach(&self, pid: u32) -> Result<Box<dyn AttachedVm>> {
        let vm = VirtualMachine::attach_with_timeout(pid, self.attach_timeout)?;
        Ok(Box::new(vm))
    }
}

/// Where HotSpot publishes one perf-data file per running JVM.
const HSPERFDATA_ROOT: &str = "/tmp";

const HSPERFDATA_PREFIX: &str = "hsperfdata_";

/// Every running JVM except this one.
///
/// A process counts as a JVM when its name or executable is `java`, or when
/// it published perf data. Launchers such as `jsvc` or renamed binaries are
/// only found through the latter.
///
/// This function performs blocking I/O and should be called via `spawn_blocking`.
pub fn list_java_processes() -> Vec<VmDescriptor> {
    let mut system = System::new();
    system.refresh_all();
    let own_pid = std::process::id();
    let perf_pids = hsperfdata_pids(Path::new(HSPERFDATA_ROOT));

    let mut found: Vec<VmDescriptor> = system
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        // threads show up as processes on Linux; keep thread-group leaders
        .filter(|(_, process)| process.thread_kind().is_none())
        .filter(|(pid, process)| {
            perf_pids.contains(&pid.as_u32())
                || looks_like_java(process.name(), process.exe(), process.cmd())
        })
        .map(|(pid, process)| VmDescriptor {
            pid: pid.as_u32(),
            display_name: display_name(process.cmd()),
        })
        .collect();

    found.sort_by_key(|vm| vm.pid);
    debug!(
        count = found.len(),
        perf_data = perf_pids.len(),
        "Listed java processes"
    );
    found
}

/// Pids with a perf-data file under `root/hsperfdata_*/`.
fn hsperfdata_pids(root: &Path) -> HashSet<u32> {
    let Ok(entries) = fs::read_dir(root) else {
        return HashSet::new();
    };

    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(HSPERFDATA_PREFIX)
        })
        .filter_map(|entry| fs::read_dir(entry.path()).ok())
        .flat_map(|files| files.flatten())
        .filter_map(|file| file.file_name().to_str()?.parse::<u32>().ok())
        .collect()
}

fn looks_like_java<S: AsRef<OsStr>>(
    name: impl AsRef<OsStr>,
    exe: Option<&Path>,
    cmd: &[S],
) -> bool {
    let is_java = |path: &Path| path.file_name().is_some_and(|f| f == "java");

    name.as_ref() == "java"
        || exe.is_some_and(is_java)
        || cmd
            .first()
            .is_some_and(|arg0| is_java(Path::new(arg0.as_ref())))
}

fn display_name<S: AsRef<OsStr>>(cmd: &[S]) -> String {
    cmd.iter()
        .skip(1)
        .map(|arg| arg.as_ref().to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_drops_executable() {
        let cmd = ["/usr/bin/java", "-Dspring.profiles.active=dev", "-jar", "orders.jar"];
        assert_eq!(
            display_name(&cmd),
            "-Dspring.profiles.active=dev -jar orders.jar"
        );
        assert_eq!(display_name::<&str>(&[]), "");
    }

    #[test]
    fn test_hsperfdata_pids_from_user_directories() {
        let root = tempfile::tempdir().unwrap();
        let alice = root.path().join("hsperfdata_alice");
        let bob = root.path().join("hsperfdata_bob");
        let other = root.path().join("systemd-private");
        for dir in [&alice, &bob, &other] {
            fs::create_dir(dir).unwrap();
        }
        fs::write(alice.join("1234"), b"").unwrap();
        fs::write(alice.join("notes"), b"").unwrap();
        fs::write(bob.join("5678"), b"").unwrap();
        fs::write(other.join("9999"), b"").unwrap();
        fs::write(root.path().join("4321"), b"").unwrap();

        let pids = hsperfdata_pids(root.path());

        assert_eq!(pids, HashSet::from([1234, 5678]));
    }

    #[test]
    fn test_hsperfdata_pids_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        assert!(hsperfdata_pids(&root.path().join("absent")).is_empty());
    }

    #[test]
    fn test_java_recognised_by_executable_path() {
        let none: [&str; 0] = [];
        assert!(looks_like_java("java", None, &none));
        assert!(looks_like_java(
            "orders-svc",
            Some(Path::new("/usr/lib/jvm/java-17/bin/java")),
            &none
        ));
        assert!(looks_like_java(
            "MainThread",
            None,
            &["/opt/jdk/bin/java", "-jar", "orders.jar"]
        ));
        assert!(!looks_like_java(
            "jsvc",
            Some(Path::new("/usr/bin/jsvc")),
            &["jsvc", "-cp", "orders.jar"]
        ));
        assert!(!looks_like_java(
            "bash",
            Some(Path::new("/bin/bash")),
            &["bash", "-c", "java -version"]
        ));
    }

    #[test]
    fn test_listing_excludes_current_process() {
        let own = std::process::id();
        assert!(list_java_processes().iter().all(|vm| vm.pid != own));
    }
}
