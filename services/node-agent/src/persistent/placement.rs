//! Choosing a node for a persistent task from published node attributes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use mlnode_capacity::MachineMemory;
use mlnode_id::{JobId, NodeId};
use mlnode_reconcile::{MACHINE_MEMORY_NODE_ATTR, MAX_OPEN_JOBS_NODE_ATTR, ML_ENABLED_NODE_ATTR};
use serde::{Deserialize, Serialize};

use crate::settings::{ByteSize, JobCapacityConfig};

/// Memory the native process needs on top of the model itself.
pub const JOB_NATIVE_OVERHEAD: ByteSize = ByteSize::from_mb(100);

/// A cluster member as seen by placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub name: String,
    /// Published attributes, keyed by attribute name (`ml.enabled`).
    pub attributes: BTreeMap<String, String>,
}

impl DiscoveryNode {
    pub fn new(id: NodeId, name: impl Into<String>, attributes: BTreeMap<String, String>) -> Self {
        Self {
            id,
            name: name.into(),
            attributes,
        }
    }

    pub fn ml_enabled(&self) -> bool {
        self.attributes
            .get(ML_ENABLED_NODE_ATTR)
            .is_some_and(|v| v == "true")
    }

    pub fn max_open_jobs(&self) -> Option<u32> {
        self.attributes.get(MAX_OPEN_JOBS_NODE_ATTR)?.parse().ok()
    }

    pub fn machine_memory(&self) -> MachineMemory {
        self.attributes
            .get(MACHINE_MEMORY_NODE_ATTR)
            .map_or(MachineMemory::Unknown, |v| MachineMemory::from_attribute(v))
    }
}

/// ML work already assigned to a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeLoad {
    pub open_jobs: u32,
    /// Jobs assigned but not yet opened.
    pub opening_jobs: u32,
    /// Sum of model memory (plus overhead) of assigned jobs.
    pub assigned_memory: u64,
}

/// Snapshot of the cluster used for one placement decision.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub nodes: Vec<DiscoveryNode>,
    pub loads: HashMap<NodeId, NodeLoad>,
    /// Node each open job is assigned to.
    pub job_nodes: HashMap<JobId, NodeId>,
}

impl ClusterView {
    pub fn load(&self, node: &NodeId) -> NodeLoad {
        self.loads.get(node).copied().unwrap_or_default()
    }

    pub fn node(&self, id: &NodeId) -> Option<&DiscoveryNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

/// Outcome of a placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Node(NodeId),
    Unassigned { reason: String },
}

impl Assignment {
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Assignment::Node(id) => Some(id),
            Assignment::Unassigned { .. } => None,
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignment::Node(id) => write!(f, "assigned to [{id}]"),
            Assignment::Unassigned { reason } => write!(f, "unassigned: {reason}"),
        }
    }
}

struct Candidate<'a> {
    node: &'a DiscoveryNode,
    free_slots: u32,
    free_memory: Option<u64>,
}

/// Pick the node for an open-job task.
///
/// A node qualifies if it advertises ML, has fewer opening jobs than the
/// concurrent allocation bound, has a free open-job slot and, when its
/// machine memory is known, enough of its ML memory share left for the
/// job. Among qualifying nodes the one with the most free memory wins;
/// if any candidate's memory is unknown, the one with the most free slots.
pub fn select_node_for_job(
    cluster: &ClusterView,
    job_id: &JobId,
    model_memory_limit: ByteSize,
    capacity: &JobCapacityConfig,
) -> Assignment {
    let Some(required) = model_memory_limit
        .bytes()
        .checked_add(JOB_NATIVE_OVERHEAD.bytes())
    else {
        return Assignment::Unassigned {
            reason: format!(
                "Not opening job [{job_id}], because its model memory limit [{model_memory_limit}] is too large"
            ),
        };
    };
    let mut reasons = Vec::new();
    let mut candidates = Vec::new();

    for node in &cluster.nodes {
        match evaluate(node, cluster.load(&node.id), required, capacity) {
            Ok(candidate) => candidates.push(candidate),
            Err(reason) => reasons.push(format!(
                "Not opening job [{job_id}] on node [{}], because {reason}",
                node.name
            )),
        }
    }

    let best = if candidates.iter().all(|c| c.free_memory.is_some()) {
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(i, c)| (c.free_memory, std::cmp::Reverse(*i)))
    } else {
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(i, c)| (c.free_slots, std::cmp::Reverse(*i)))
    };

    match best {
        Some((_, candidate)) => Assignment::Node(candidate.node.id),
        None if reasons.is_empty() => Assignment::Unassigned {
            reason: "no nodes in the cluster".to_string(),
        },
        None => Assignment::Unassigned {
            reason: reasons.join("|"),
        },
    }
}

fn evaluate<'a>(
    node: &'a DiscoveryNode,
    load: NodeLoad,
    required: u64,
    capacity: &JobCapacityConfig,
) -> Result<Candidate<'a>, String> {
    if !node.ml_enabled() {
        return Err("node isn't an ml node".to_string());
    }

    if load.opening_jobs >= capacity.max_concurrent_job_allocations {
        return Err(format!(
            "node exceeds [{}] the maximum number of jobs [{}] in opening state",
            load.opening_jobs, capacity.max_concurrent_job_allocations
        ));
    }

    let Some(max_open_jobs) = node.max_open_jobs() else {
        return Err("node does not publish max_open_jobs".to_string());
    };
    let assigned = load.open_jobs + load.opening_jobs;
    if assigned >= max_open_jobs {
        return Err(format!(
            "this node is full. Number of opened jobs [{assigned}], max_open_jobs [{max_open_jobs}]"
        ));
    }

    let free_memory = match node.machine_memory().bytes() {
        Some(machine) => {
            let ml_share = machine / 100 * u64::from(capacity.max_machine_memory_percent);
            let available = ml_share.saturating_sub(load.assigned_memory);
            if required > available {
                return Err(format!(
                    "this node has insufficient available memory. Available memory for ML [{ml_share}], memory required by existing jobs [{}], estimated memory required for this job [{required}]",
                    load.assigned_memory
                ));
            }
            Some(available - required)
        }
        None => None,
    };

    Ok(Candidate {
        node,
        free_slots: max_open_jobs - assigned,
        free_memory,
    })
}

/// Pick the node for a start-datafeed task: wherever its job runs.
pub fn select_node_for_datafeed(cluster: &ClusterView, job_id: &JobId) -> Assignment {
    match cluster.job_nodes.get(job_id) {
        Some(node) if cluster.node(node).is_some() => Assignment::Node(*node),
        Some(node) => Assignment::Unassigned {
            reason: format!("cannot start datafeed, job [{job_id}] is assigned to departed node [{node}]"),
        },
        None => Assignment::Unassigned {
            reason: format!("cannot start datafeed, job [{job_id}] is not assigned to any node"),
        },
    }
}
