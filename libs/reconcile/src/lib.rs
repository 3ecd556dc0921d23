//! Node attribute reconciliation.
//!
//! Every ML-capable node publishes three reserved node attributes that the
//! coordination layer reads when placing jobs:
//!
//! - `ml.enabled`: `"true"` on nodes that accept jobs
//! - `ml.max_open_jobs`: how many jobs the node may hold open
//! - `ml.machine_memory`: memory available to the node, in bytes
//!
//! The values are always computed, never taken from the user. Nodes restart
//! with the settings they were last started with, so a reserved key may
//! already be present locally; that is accepted only when it carries exactly
//! the computed value.
//!
//! # Invariants
//!
//! - Reconciliation is a pure function of its inputs
//! - A clash is reported before anything is published
//! - A node that does not advertise capacity has no reserved keys at all

use std::collections::BTreeMap;

use mlnode_capacity::MachineMemory;
use thiserror::Error;
use tracing::debug;

/// Prefix under which node attributes appear in node settings.
pub const NODE_ATTR_PREFIX: &str = "node.attr.";

/// Attribute flagging a node as able to run jobs.
pub const ML_ENABLED_NODE_ATTR: &str = "ml.enabled";

/// Attribute carrying the per-node open job limit.
pub const MAX_OPEN_JOBS_NODE_ATTR: &str = "ml.max_open_jobs";

/// Attribute carrying the node's memory in bytes.
pub const MACHINE_MEMORY_NODE_ATTR: &str = "ml.machine_memory";

/// The reserved attributes, in publication order.
pub const RESERVED_NODE_ATTRS: [&str; 3] = [
    ML_ENABLED_NODE_ATTR,
    MAX_OPEN_JOBS_NODE_ATTR,
    MACHINE_MEMORY_NODE_ATTR,
];

/// Settings key for a node attribute.
pub fn node_attr_setting(attr: &str) -> String {
    format!("{}{}", NODE_ATTR_PREFIX, attr)
}

// =============================================================================
// Errors
// =============================================================================

/// Reconciliation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// A reserved node attribute was set directly in node settings.
    #[error("Directly setting [{key}] is not permitted - it is reserved for machine learning. If your intention was to customize machine learning, set the [{replacement}] setting instead.")]
    ClashingAttribute { key: String, replacement: String },
}

impl ReconcileError {
    fn clash(key: &str) -> Self {
        Self::ClashingAttribute {
            key: key.to_string(),
            replacement: key.replacen(NODE_ATTR_PREFIX, "", 1),
        }
    }
}

// =============================================================================
// Node Settings
// =============================================================================

/// Flat, dotted-key view of a node's locally persisted settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSettings(BTreeMap<String, String>);

impl NodeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a raw setting value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a raw setting value, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Settings with the reconciled attributes merged in.
    ///
    /// Reconciliation guarantees any pre-existing reserved key already has
    /// the same value, so merging never changes an existing entry.
    pub fn merged_with(&self, attributes: &NodeAttributeSet) -> NodeSettings {
        let mut merged = self.clone();
        for (key, value) in &attributes.0 {
            merged.0.insert(key.clone(), value.clone());
        }
        merged
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NodeSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// =============================================================================
// Node Attribute Set
// =============================================================================

/// Reserved attributes a node publishes, keyed by their settings key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAttributeSet(BTreeMap<String, String>);

impl NodeAttributeSet {
    /// The empty set published by nodes that take no jobs.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Value of an attribute by attribute name (e.g. `ml.max_open_jobs`).
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.0.get(&node_attr_setting(attr)).map(String::as_str)
    }

    /// Settings keys and values.
    pub fn settings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Attributes as published in node metadata, without the settings prefix.
    pub fn node_attributes(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.trim_start_matches(NODE_ATTR_PREFIX).to_string(), v.clone()))
            .collect()
    }
}

// =============================================================================
// Eligibility
// =============================================================================

/// Deployment mode of the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeploymentMode {
    /// A regular cluster node.
    #[default]
    Node,
    /// A transport-only client embedded in another process.
    TransportClient,
    /// A gateway node federating other clusters.
    Gateway,
    /// A client node inside a gateway.
    GatewayClient,
}

impl DeploymentMode {
    /// Returns true for modes that never host ML functionality.
    pub fn is_restricted(&self) -> bool {
        !matches!(self, Self::Node)
    }
}

/// Why a node does not take ML jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledReason {
    /// The ML feature is switched off for this process.
    FeatureDisabled,
    /// The process runs in a restricted deployment mode.
    RestrictedMode(DeploymentMode),
    /// The feature is on, but this node opted out of running jobs.
    NodeRoleDisabled,
}

/// The up-front decision on whether this node takes part in ML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Enabled,
    Disabled(DisabledReason),
}

impl Eligibility {
    /// Decide eligibility from the feature flag, the node role flag and the
    /// deployment mode. Restricted modes win over everything else.
    pub fn decide(feature_enabled: bool, node_role_enabled: bool, mode: DeploymentMode) -> Self {
        if mode.is_restricted() {
            Self::Disabled(DisabledReason::RestrictedMode(mode))
        } else if !feature_enabled {
            Self::Disabled(DisabledReason::FeatureDisabled)
        } else if !node_role_enabled {
            Self::Disabled(DisabledReason::NodeRoleDisabled)
        } else {
            Self::Enabled
        }
    }

    /// Whether the node publishes the reserved attributes.
    pub fn advertises_capacity(&self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Whether the node assembles job managers and task executors.
    ///
    /// Nodes that only opted out of the role still coordinate jobs; they
    /// just never get any placed on them.
    pub fn assembles_components(&self) -> bool {
        matches!(
            self,
            Self::Enabled | Self::Disabled(DisabledReason::NodeRoleDisabled)
        )
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Values the reconciler advertises for an enabled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeInputs {
    pub max_open_jobs: u32,
    pub machine_memory: MachineMemory,
}

/// Computes the attribute set a node publishes on startup.
pub struct NodeAttributeReconciler<'a> {
    settings: &'a NodeSettings,
}

impl<'a> NodeAttributeReconciler<'a> {
    pub fn new(settings: &'a NodeSettings) -> Self {
        Self { settings }
    }

    /// Produce the attribute set, or fail if node settings clash with it.
    pub fn reconcile(
        &self,
        eligibility: Eligibility,
        inputs: &AttributeInputs,
    ) -> Result<NodeAttributeSet, ReconcileError> {
        if !eligibility.advertises_capacity() {
            self.disallow_reserved()?;
            debug!(?eligibility, "Node does not advertise ML capacity");
            return Ok(NodeAttributeSet::empty());
        }

        let computed = [
            (ML_ENABLED_NODE_ATTR, "true".to_string()),
            (MAX_OPEN_JOBS_NODE_ATTR, inputs.max_open_jobs.to_string()),
            (MACHINE_MEMORY_NODE_ATTR, inputs.machine_memory.to_string()),
        ];

        let mut attributes = BTreeMap::new();
        for (attr, value) in computed {
            let key = node_attr_setting(attr);
            match self.settings.get(&key) {
                Some(existing) if existing != value => return Err(ReconcileError::clash(&key)),
                _ => {
                    attributes.insert(key, value);
                }
            }
        }

        Ok(NodeAttributeSet(attributes))
    }

    fn disallow_reserved(&self) -> Result<(), ReconcileError> {
        for attr in RESERVED_NODE_ATTRS {
            let key = node_attr_setting(attr);
            if self.settings.contains_key(&key) {
                return Err(ReconcileError::clash(&key));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn inputs() -> AttributeInputs {
        AttributeInputs {
            max_open_jobs: 10,
            machine_memory: MachineMemory::Bytes(8 * 1024 * 1024 * 1024),
        }
    }

    #[test]
    fn test_enabled_node_advertises_all_attributes() {
        let settings = NodeSettings::new();
        let attrs = NodeAttributeReconciler::new(&settings)
            .reconcile(Eligibility::Enabled, &inputs())
            .unwrap();

        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs.get(ML_ENABLED_NODE_ATTR), Some("true"));
        assert_eq!(attrs.get(MAX_OPEN_JOBS_NODE_ATTR), Some("10"));
        assert_eq!(attrs.get(MACHINE_MEMORY_NODE_ATTR), Some("8589934592"));
    }

    #[test]
    fn test_reconcile_is_idempotent_across_restarts() {
        let settings = NodeSettings::new();
        let first = NodeAttributeReconciler::new(&settings)
            .reconcile(Eligibility::Enabled, &inputs())
            .unwrap();

        // A restarted node sees its previous attributes in its settings.
        let restarted = settings.merged_with(&first);
        let second = NodeAttributeReconciler::new(&restarted)
            .reconcile(Eligibility::Enabled, &inputs())
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_clashing_value_is_rejected() {
        let settings: NodeSettings = [("node.attr.ml.max_open_jobs", "99")].into_iter().collect();
        let err = NodeAttributeReconciler::new(&settings)
            .reconcile(Eligibility::Enabled, &inputs())
            .unwrap_err();

        assert_eq!(
            err,
            ReconcileError::ClashingAttribute {
                key: "node.attr.ml.max_open_jobs".to_string(),
                replacement: "ml.max_open_jobs".to_string(),
            }
        );
        assert!(err.to_string().contains("set the [ml.max_open_jobs] setting instead"));
    }

    #[test]
    fn test_clashing_memory_after_resize_is_rejected() {
        let settings: NodeSettings = [("node.attr.ml.machine_memory", "1024")].into_iter().collect();
        let result = NodeAttributeReconciler::new(&settings).reconcile(Eligibility::Enabled, &inputs());
        assert!(matches!(
            result,
            Err(ReconcileError::ClashingAttribute { ref key, .. }) if key == "node.attr.ml.machine_memory"
        ));
    }

    #[test]
    fn test_unknown_memory_is_advertised_as_sentinel() {
        let settings = NodeSettings::new();
        let attrs = NodeAttributeReconciler::new(&settings)
            .reconcile(
                Eligibility::Enabled,
                &AttributeInputs {
                    max_open_jobs: 20,
                    machine_memory: MachineMemory::Unknown,
                },
            )
            .unwrap();
        assert_eq!(attrs.get(MACHINE_MEMORY_NODE_ATTR), Some("-1"));
    }

    #[rstest]
    #[case(DisabledReason::FeatureDisabled)]
    #[case(DisabledReason::NodeRoleDisabled)]
    #[case(DisabledReason::RestrictedMode(DeploymentMode::TransportClient))]
    #[case(DisabledReason::RestrictedMode(DeploymentMode::Gateway))]
    fn test_disabled_node_publishes_nothing(#[case] reason: DisabledReason) {
        let settings: NodeSettings = [("cluster.name", "test")].into_iter().collect();
        let attrs = NodeAttributeReconciler::new(&settings)
            .reconcile(Eligibility::Disabled(reason), &inputs())
            .unwrap();
        assert!(attrs.is_empty());
    }

    #[rstest]
    #[case("node.attr.ml.enabled", "true")]
    #[case("node.attr.ml.max_open_jobs", "10")]
    #[case("node.attr.ml.machine_memory", "8589934592")]
    fn test_disabled_node_rejects_any_reserved_key(#[case] key: &str, #[case] value: &str) {
        let settings: NodeSettings = [(key, value)].into_iter().collect();
        let err = NodeAttributeReconciler::new(&settings)
            .reconcile(Eligibility::Disabled(DisabledReason::FeatureDisabled), &inputs())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ClashingAttribute { key: ref k, .. } if k == key));
    }

    #[rstest]
    #[case(true, true, DeploymentMode::Node, Eligibility::Enabled)]
    #[case(false, true, DeploymentMode::Node, Eligibility::Disabled(DisabledReason::FeatureDisabled))]
    #[case(true, false, DeploymentMode::Node, Eligibility::Disabled(DisabledReason::NodeRoleDisabled))]
    #[case(
        true,
        true,
        DeploymentMode::GatewayClient,
        Eligibility::Disabled(DisabledReason::RestrictedMode(DeploymentMode::GatewayClient))
    )]
    #[case(
        false,
        false,
        DeploymentMode::TransportClient,
        Eligibility::Disabled(DisabledReason::RestrictedMode(DeploymentMode::TransportClient))
    )]
    fn test_eligibility_decision(
        #[case] feature: bool,
        #[case] role: bool,
        #[case] mode: DeploymentMode,
        #[case] expected: Eligibility,
    ) {
        assert_eq!(Eligibility::decide(feature, role, mode), expected);
    }

    #[test]
    fn test_node_role_disabled_still_assembles() {
        let eligibility = Eligibility::Disabled(DisabledReason::NodeRoleDisabled);
        assert!(eligibility.assembles_components());
        assert!(!eligibility.advertises_capacity());

        let restricted = Eligibility::Disabled(DisabledReason::RestrictedMode(DeploymentMode::Gateway));
        assert!(!restricted.assembles_components());
    }

    #[test]
    fn test_published_attribute_names() {
        let settings = NodeSettings::new();
        let attrs = NodeAttributeReconciler::new(&settings)
            .reconcile(Eligibility::Enabled, &inputs())
            .unwrap();
        let published = attrs.node_attributes();
        assert_eq!(
            published.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["ml.enabled", "ml.machine_memory", "ml.max_open_jobs"]
        );
    }
}
