//! Probes that produce [`CapacityReading`]s.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::reading::{CapacityReading, ContainerLimit, UNKNOWN_MEMORY};

/// Default location of the kernel memory summary.
const DEFAULT_MEMINFO_PATH: &str = "/proc/meminfo";

/// Default mount point of the cgroup filesystem.
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Memory limit file under a cgroup v2 mount.
const CGROUP_V2_LIMIT_FILE: &str = "memory.max";

/// Memory limit file under a cgroup v1 mount.
const CGROUP_V1_LIMIT_FILE: &str = "memory/memory.limit_in_bytes";

/// Source of capacity readings.
pub trait CapacityProbe: Send + Sync {
    /// Take a reading. Never fails; unmeasurable values are reported as unknown.
    fn read(&self) -> CapacityReading;
}

/// Probe that reads the local OS and cgroup filesystem.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    meminfo_path: PathBuf,
    cgroup_root: PathBuf,
    sysconf_fallback: bool,
}

impl SystemProbe {
    /// Probe the real host.
    pub fn new() -> Self {
        Self {
            meminfo_path: PathBuf::from(DEFAULT_MEMINFO_PATH),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            sysconf_fallback: true,
        }
    }

    /// Probe alternative file locations. `sysconf` is not consulted, so a
    /// missing meminfo file yields unknown host memory.
    pub fn with_paths(meminfo_path: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: meminfo_path.into(),
            cgroup_root: cgroup_root.into(),
            sysconf_fallback: false,
        }
    }

    fn host_memory(&self) -> i64 {
        if let Ok(content) = std::fs::read_to_string(&self.meminfo_path) {
            if let Some(total) = parse_meminfo_total(&content) {
                return total;
            }
        }

        if self.sysconf_fallback {
            if let Some(total) = sysconf_total_memory() {
                return total;
            }
        }

        debug!(path = %self.meminfo_path.display(), "Host memory could not be determined");
        UNKNOWN_MEMORY
    }

    fn container_limit(&self) -> Option<ContainerLimit> {
        [CGROUP_V2_LIMIT_FILE, CGROUP_V1_LIMIT_FILE]
            .iter()
            .find_map(|file| read_limit_file(&self.cgroup_root.join(file)))
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityProbe for SystemProbe {
    fn read(&self) -> CapacityReading {
        let reading = CapacityReading {
            host_memory_bytes: self.host_memory(),
            container_limit: self.container_limit(),
        };
        debug!(
            host_memory_bytes = reading.host_memory_bytes,
            container_limit = ?reading.container_limit,
            "Capacity probed"
        );
        reading
    }
}

/// Probe returning a fixed reading.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub CapacityReading);

impl CapacityProbe for StaticProbe {
    fn read(&self) -> CapacityReading {
        self.0
    }
}

fn read_limit_file(path: &Path) -> Option<ContainerLimit> {
    let content = std::fs::read_to_string(path).ok()?;
    let limit = ContainerLimit::parse(&content);
    if limit.is_none() {
        debug!(path = %path.display(), "Ignoring unparseable cgroup memory limit");
    }
    limit
}

/// Extract `MemTotal` from `/proc/meminfo` content, in bytes.
fn parse_meminfo_total(content: &str) -> Option<i64> {
    const KB_TO_BYTES: i64 = 1024;

    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != "MemTotal:" {
            return None;
        }
        let kb: i64 = parts.next()?.parse().ok()?;
        kb.checked_mul(KB_TO_BYTES)
    })
}

#[cfg(unix)]
fn sysconf_total_memory() -> Option<i64> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        (page_size as i64).checked_mul(total_pages as i64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn sysconf_total_memory() -> Option<i64> {
    None
}
