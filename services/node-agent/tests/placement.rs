//! Integration tests for job placement from reconciled node attributes.

use std::collections::HashMap;

use mlnode_agent::persistent::placement::{select_node_for_job, JOB_NATIVE_OVERHEAD};
use mlnode_agent::persistent::{Assignment, ClusterView, DiscoveryNode, NodeLoad};
use mlnode_agent::settings::{ByteSize, JobCapacityConfig, MlSettings};
use mlnode_capacity::{CapacityReading, ContainerLimit};
use mlnode_id::{JobId, NodeId};
use mlnode_reconcile::{AttributeInputs, NodeAttributeReconciler, NodeSettings};
use rstest::rstest;

const GB: i64 = 1 << 30;

/// Build a cluster member the way a node would advertise itself.
fn advertised_node(name: &str, settings: &[(&str, &str)], reading: CapacityReading) -> DiscoveryNode {
    let settings: NodeSettings = settings.iter().copied().collect();
    let ml = MlSettings::from_settings(&settings).unwrap();
    let attributes = NodeAttributeReconciler::new(&settings)
        .reconcile(
            ml.eligibility(),
            &AttributeInputs {
                max_open_jobs: ml.capacity.max_open_jobs_per_node,
                machine_memory: reading.effective_memory(),
            },
        )
        .unwrap();
    DiscoveryNode::new(NodeId::new(), name, attributes.node_attributes())
}

fn job() -> JobId {
    JobId::parse("response-times").unwrap()
}

#[test]
fn test_container_limited_node_loses_to_larger_host() {
    let limited = advertised_node(
        "limited",
        &[],
        CapacityReading::with_container_limit(64 * GB, ContainerLimit::Bytes(4 * GB as i128)),
    );
    let large = advertised_node("large", &[], CapacityReading::host_only(32 * GB));
    let cluster = ClusterView {
        nodes: vec![limited, large.clone()],
        ..Default::default()
    };

    let assignment = select_node_for_job(
        &cluster,
        &job(),
        ByteSize::from_mb(512),
        &JobCapacityConfig::default(),
    );
    assert_eq!(assignment, Assignment::Node(large.id));
}

#[test]
fn test_only_ml_nodes_are_candidates() {
    let data_only = advertised_node("data", &[("node.ml", "false")], CapacityReading::host_only(64 * GB));
    let ml = advertised_node("ml", &[], CapacityReading::host_only(8 * GB));
    let cluster = ClusterView {
        nodes: vec![data_only, ml.clone()],
        ..Default::default()
    };

    let assignment = select_node_for_job(
        &cluster,
        &job(),
        ByteSize::from_mb(512),
        &JobCapacityConfig::default(),
    );
    assert_eq!(assignment, Assignment::Node(ml.id));
}

#[rstest]
#[case::fits(30, true)]
#[case::share_too_small(5, false)]
fn test_machine_memory_percent_bounds_placement(#[case] percent: u32, #[case] fits: bool) {
    let node = advertised_node("ml", &[], CapacityReading::host_only(8 * GB));
    let cluster = ClusterView {
        nodes: vec![node],
        ..Default::default()
    };
    let capacity = JobCapacityConfig {
        max_machine_memory_percent: percent,
        ..Default::default()
    };

    let assignment = select_node_for_job(&cluster, &job(), ByteSize::from_mb(1024), &capacity);
    assert_eq!(assignment.node().is_some(), fits, "{assignment}");
}

#[test]
fn test_assigned_memory_counts_against_node() {
    let node = advertised_node("ml", &[("ml.max_open_jobs", "50")], CapacityReading::host_only(16 * GB));
    let per_job = ByteSize::from_mb(1024).bytes() + JOB_NATIVE_OVERHEAD.bytes();
    // 30% of 16 GB holds four 1 GB jobs with overhead, not five.
    let mut cluster = ClusterView {
        nodes: vec![node.clone()],
        loads: HashMap::new(),
        job_nodes: HashMap::new(),
    };

    cluster.loads.insert(
        node.id,
        NodeLoad {
            open_jobs: 3,
            opening_jobs: 0,
            assigned_memory: 3 * per_job,
        },
    );
    let capacity = JobCapacityConfig::default();
    assert_eq!(
        select_node_for_job(&cluster, &job(), ByteSize::from_mb(1024), &capacity),
        Assignment::Node(node.id)
    );

    cluster.loads.insert(
        node.id,
        NodeLoad {
            open_jobs: 4,
            opening_jobs: 0,
            assigned_memory: 4 * per_job,
        },
    );
    assert!(matches!(
        select_node_for_job(&cluster, &job(), ByteSize::from_mb(1024), &capacity),
        Assignment::Unassigned { .. }
    ));
}
