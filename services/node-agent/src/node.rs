//! Node startup and shutdown.
//!
//! Startup runs once, in order: read ML settings, decide eligibility, probe
//! capacity, reconcile the published attributes, set up dynamic settings,
//! start the template worker, assemble the scheduling components and
//! register the persistent task executors. Any error before the first
//! spawned worker aborts startup.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlnode_capacity::{CapacityProbe, MachineMemory};
use mlnode_id::NodeId;
use mlnode_reconcile::{
    AttributeInputs, Eligibility, NodeAttributeReconciler, NodeAttributeSet, NodeSettings,
};
use mlnode_templates::{TemplateBootstrapper, TemplateContext, TemplateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::datafeed::DataExtractor;
use crate::error::MlError;
use crate::facade::{AssemblyInputs, MlAssembly};
use crate::persistent::PersistentTasksNodeService;
use crate::pools::PoolPlan;
use crate::settings::{DynamicSettings, MlSettings};
use crate::storage::ResultsWriter;
use crate::template_worker::TemplateUpgradeWorker;

/// Everything a node needs to start.
pub struct NodeBootstrap {
    pub node_id: NodeId,
    pub node_name: String,
    pub home: PathBuf,
    /// Locally persisted node settings.
    pub settings: NodeSettings,
    pub probe: Arc<dyn CapacityProbe>,
    pub template_store: Arc<dyn TemplateStore>,
    pub writer: Arc<dyn ResultsWriter>,
    pub extractor: Arc<dyn DataExtractor>,
    pub template_check_interval: Duration,
    pub task_cancel_timeout: Duration,
}

/// A started ML node.
pub struct MlNode {
    node_id: NodeId,
    ml_settings: MlSettings,
    eligibility: Eligibility,
    machine_memory: MachineMemory,
    attributes: NodeAttributeSet,
    node_settings: NodeSettings,
    dynamic: DynamicSettings,
    templates: Arc<TemplateUpgradeWorker>,
    assembly: MlAssembly,
    tasks: Arc<PersistentTasksNodeService>,
    cluster_state: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MlNode {
    #[instrument(skip_all, fields(node_id = %bootstrap.node_id))]
    pub async fn start(bootstrap: NodeBootstrap) -> Result<Self, MlError> {
        let ml_settings = MlSettings::from_settings(&bootstrap.settings)?;
        let eligibility = ml_settings.eligibility();

        let reading = bootstrap.probe.read();
        let machine_memory = reading.effective_memory();
        info!(
            ?eligibility,
            machine_memory = %machine_memory,
            host_memory_bytes = reading.host_memory_bytes,
            "ML capacity probed"
        );

        let attributes = NodeAttributeReconciler::new(&bootstrap.settings).reconcile(
            eligibility,
            &AttributeInputs {
                max_open_jobs: ml_settings.capacity.max_open_jobs_per_node,
                machine_memory,
            },
        )?;
        let node_settings = bootstrap.settings.merged_with(&attributes);

        let dynamic = DynamicSettings::new(ml_settings.capacity);

        let bootstrapper = Arc::new(TemplateBootstrapper::new(
            TemplateContext::new(
                ml_settings.autodetect_process,
                ml_settings.delayed_node_left_timeout,
            ),
            bootstrap.template_store,
        ));
        let templates = Arc::new(TemplateUpgradeWorker::new(
            bootstrapper,
            bootstrap.template_check_interval,
        ));

        let assembly = MlAssembly::assemble(AssemblyInputs {
            eligibility,
            native_process: ml_settings.autodetect_process,
            home: bootstrap.home,
            node_name: bootstrap.node_name,
            pool_plan: PoolPlan::for_max_open_jobs(ml_settings.capacity.max_open_jobs_per_node),
            capacity: dynamic.subscribe(),
            writer: bootstrap.writer,
            extractor: bootstrap.extractor,
            templates_ready: templates.readiness(),
        })?;

        let tasks = Arc::new(PersistentTasksNodeService::new(
            bootstrap.node_id,
            assembly.persistent_task_executors(),
            bootstrap.task_cancel_timeout,
        ));

        let (cluster_state, cluster_state_rx) = watch::channel(0u64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = vec![tokio::spawn(
            Arc::clone(&templates).run(cluster_state_rx, shutdown_rx.clone()),
        )];
        if let Some(components) = assembly.components() {
            workers.push(tokio::spawn(
                Arc::clone(&components.auditor).run_flusher(shutdown_rx),
            ));
        }

        info!(
            attributes = attributes.len(),
            task_executors = ?tasks.task_names(),
            "ML node started"
        );

        Ok(Self {
            node_id: bootstrap.node_id,
            ml_settings,
            eligibility,
            machine_memory,
            attributes,
            node_settings,
            dynamic,
            templates,
            assembly,
            tasks,
            cluster_state,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn ml_settings(&self) -> &MlSettings {
        &self.ml_settings
    }

    pub fn eligibility(&self) -> Eligibility {
        self.eligibility
    }

    pub fn machine_memory(&self) -> MachineMemory {
        self.machine_memory
    }

    /// Attributes this node publishes to the cluster.
    pub fn attributes(&self) -> &NodeAttributeSet {
        &self.attributes
    }

    /// Node settings with the published attributes merged in.
    pub fn node_settings(&self) -> &NodeSettings {
        &self.node_settings
    }

    pub fn dynamic_settings(&self) -> &DynamicSettings {
        &self.dynamic
    }

    pub fn assembly(&self) -> &MlAssembly {
        &self.assembly
    }

    pub fn persistent_tasks(&self) -> &Arc<PersistentTasksNodeService> {
        &self.tasks
    }

    pub fn templates_ready(&self) -> bool {
        self.templates.is_ready()
    }

    pub fn template_readiness(&self) -> watch::Receiver<bool> {
        self.templates.readiness()
    }

    /// Tell the node a new cluster state was applied.
    pub fn notify_cluster_state_changed(&self, version: u64) {
        self.cluster_state.send_replace(version);
    }

    /// Stop datafeeds, close open jobs, cancel remaining persistent tasks,
    /// stop background workers and drain the worker pools.
    pub async fn shutdown(&self, grace: Duration) {
        info!("ML node shutting down");

        if let Some(components) = self.assembly.components() {
            components.datafeeds.stop_all();
            components.processes.close_all().await;
        }
        self.tasks.shutdown().await;

        self.shutdown.send_replace(true);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Background worker ended abnormally");
            }
        }

        if let Some(components) = self.assembly.components() {
            components.pools.shutdown(grace).await;
        }
        info!("ML node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::EmptyExtractor;
    use crate::settings::{CapacityUpdate, SettingsError};
    use crate::storage::InMemoryResultsWriter;
    use mlnode_capacity::{CapacityReading, ContainerLimit, StaticProbe};
    use mlnode_reconcile::{DisabledReason, ReconcileError};
    use mlnode_templates::InMemoryTemplateStore;

    const GB: i64 = 1 << 30;

    fn bootstrap(settings: &[(&str, &str)], reading: CapacityReading) -> NodeBootstrap {
        let mut node_settings: NodeSettings = settings.iter().copied().collect();
        node_settings.insert("ml.autodetect_process", "false");
        NodeBootstrap {
            node_id: NodeId::new(),
            node_name: "node-1".to_string(),
            home: PathBuf::from("/nonexistent"),
            settings: node_settings,
            probe: Arc::new(StaticProbe(reading)),
            template_store: Arc::new(InMemoryTemplateStore::new()),
            writer: Arc::new(InMemoryResultsWriter::new()),
            extractor: Arc::new(EmptyExtractor),
            template_check_interval: Duration::from_secs(3600),
            task_cancel_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_enabled_node_publishes_container_limit() {
        let reading = CapacityReading::with_container_limit(16 * GB, ContainerLimit::Bytes(4 * GB as i128));
        let node = MlNode::start(bootstrap(&[], reading)).await.unwrap();

        assert_eq!(node.attributes().get("ml.enabled"), Some("true"));
        assert_eq!(node.attributes().get("ml.max_open_jobs"), Some("20"));
        assert_eq!(
            node.attributes().get("ml.machine_memory"),
            Some((4 * GB).to_string().as_str())
        );
        assert_eq!(
            node.node_settings().get("node.attr.ml.machine_memory"),
            Some((4 * GB).to_string().as_str())
        );
        assert_eq!(node.persistent_tasks().task_names(), vec!["open-job", "start-datafeed"]);

        node.template_readiness().wait_for(|r| *r).await.unwrap();
        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_disabled_node_registers_nothing() {
        let node = MlNode::start(bootstrap(&[("ml.enabled", "false")], CapacityReading::host_only(8 * GB)))
            .await
            .unwrap();

        assert!(node.attributes().is_empty());
        assert_eq!(
            node.eligibility(),
            Eligibility::Disabled(DisabledReason::FeatureDisabled)
        );
        assert!(!node.assembly().is_enabled());
        assert!(node.persistent_tasks().task_names().is_empty());
        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_clashing_attribute_aborts_startup() {
        let err = MlNode::start(bootstrap(
            &[("node.attr.ml.max_open_jobs", "10")],
            CapacityReading::host_only(8 * GB),
        ))
        .await
        .err()
        .unwrap();

        assert!(matches!(
            err,
            MlError::ConfigurationConflict(ReconcileError::ClashingAttribute { .. })
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_restart_with_published_attributes_is_idempotent() {
        let reading = CapacityReading::host_only(8 * GB);
        let first = MlNode::start(bootstrap(&[], reading)).await.unwrap();
        let persisted: Vec<(String, String)> = first
            .node_settings()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        first.shutdown(Duration::from_secs(1)).await;

        let pairs: Vec<(&str, &str)> = persisted.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let second = MlNode::start(bootstrap(&pairs, reading)).await.unwrap();
        assert_eq!(second.attributes(), first.attributes());
        second.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_invalid_setting_aborts_startup() {
        let err = MlNode::start(bootstrap(
            &[("ml.max_machine_memory_percent", "95")],
            CapacityReading::host_only(8 * GB),
        ))
        .await
        .err()
        .unwrap();
        assert!(matches!(err, MlError::Settings(SettingsError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn test_dynamic_update_reaches_job_manager() {
        let node = MlNode::start(bootstrap(&[], CapacityReading::host_only(8 * GB)))
            .await
            .unwrap();
        node.dynamic_settings()
            .apply(CapacityUpdate {
                max_machine_memory_percent: Some(50),
                ..Default::default()
            })
            .unwrap();

        let jobs = &node.assembly().components().unwrap().jobs;
        assert_eq!(jobs.capacity().max_machine_memory_percent, 50);
        node.shutdown(Duration::from_secs(1)).await;
    }
}
