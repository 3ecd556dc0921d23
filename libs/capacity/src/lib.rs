//! # mlnode-capacity
//!
//! Measures how much memory this node can offer to analytics jobs.
//!
//! Host memory comes from `/proc/meminfo` (or `sysconf` as a fallback) and
//! may be unknown. When the node runs inside a container, the cgroup memory
//! limit is read as well and preferred whenever it is a real, smaller limit.
//! Readings never fail: anything that cannot be measured is reported as
//! unknown.

mod probe;
mod reading;

pub use probe::{CapacityProbe, StaticProbe, SystemProbe};
pub use reading::{CapacityReading, ContainerLimit, MachineMemory, UNKNOWN_MEMORY};
