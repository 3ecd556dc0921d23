//! Capacity readings and the effective-memory resolution rule.

use std::fmt;
use std::num::IntErrorKind;

/// Sentinel used for host memory that could not be measured.
pub const UNKNOWN_MEMORY: i64 = -1;

/// A container memory limit as read from the cgroup filesystem.
///
/// Limits are parsed wider than `i64` because "no limit" is often written
/// as a huge number rather than a keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerLimit {
    /// A numeric limit in bytes.
    Bytes(i128),
    /// No limit (`max`, or a value too large to represent).
    Unbounded,
}

impl ContainerLimit {
    /// Parse the contents of a cgroup memory limit file.
    ///
    /// Returns `None` for anything that is not a number or `max`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw == "max" {
            return Some(Self::Unbounded);
        }

        match raw.parse::<i128>() {
            Ok(bytes) => Some(Self::Bytes(bytes)),
            Err(e) if *e.kind() == IntErrorKind::PosOverflow => Some(Self::Unbounded),
            Err(_) => None,
        }
    }

    /// Returns the limit if it is usable as a real memory bound.
    fn usable_bytes(&self) -> Option<i64> {
        match *self {
            Self::Bytes(bytes) if bytes > 0 && bytes < i64::MAX as i128 => Some(bytes as i64),
            _ => None,
        }
    }
}

/// One measurement of the memory available to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReading {
    /// Total host memory in bytes; negative means unknown.
    pub host_memory_bytes: i64,

    /// Container memory ceiling, when running inside a cgroup with a limit file.
    pub container_limit: Option<ContainerLimit>,
}

impl CapacityReading {
    /// A reading with only host memory.
    pub fn host_only(host_memory_bytes: i64) -> Self {
        Self {
            host_memory_bytes,
            container_limit: None,
        }
    }

    /// A reading with host memory and a container limit.
    pub fn with_container_limit(host_memory_bytes: i64, limit: ContainerLimit) -> Self {
        Self {
            host_memory_bytes,
            container_limit: Some(limit),
        }
    }

    /// Returns true if host memory could be measured.
    pub fn host_memory_known(&self) -> bool {
        self.host_memory_bytes >= 0
    }

    /// Resolve the memory this node should advertise.
    ///
    /// The container limit wins when it is a real limit (positive and below
    /// `i64::MAX`) and either host memory is unknown or the limit is smaller
    /// than host memory. Otherwise host memory is used as-is, which may
    /// leave the result unknown.
    pub fn effective_memory(&self) -> MachineMemory {
        if let Some(limit) = self.container_limit.and_then(|l| l.usable_bytes()) {
            if !self.host_memory_known() || limit < self.host_memory_bytes {
                return MachineMemory::Bytes(limit as u64);
            }
        }

        MachineMemory::from_raw(self.host_memory_bytes)
    }
}

/// Memory advertised by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineMemory {
    /// Known memory in bytes.
    Bytes(u64),
    /// Memory could not be determined.
    Unknown,
}

impl MachineMemory {
    /// Interpret a raw byte count where negative values mean unknown.
    pub fn from_raw(bytes: i64) -> Self {
        if bytes >= 0 {
            Self::Bytes(bytes as u64)
        } else {
            Self::Unknown
        }
    }

    /// Parse an advertised attribute value.
    pub fn from_attribute(value: &str) -> Self {
        value
            .trim()
            .parse::<i64>()
            .map(Self::from_raw)
            .unwrap_or(Self::Unknown)
    }

    /// Returns the byte count, if known.
    pub fn bytes(&self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(*bytes),
            Self::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }
}

impl fmt::Display for MachineMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{}", bytes),
            Self::Unknown => write!(f, "{}", UNKNOWN_MEMORY),
        }
    }
}
