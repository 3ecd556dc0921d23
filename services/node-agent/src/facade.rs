//! Assembles the ML job scheduling components for a node.
//!
//! Assembly happens once, after eligibility is decided. A node that does
//! not take part in ML gets nothing: no managers, no worker pools and no
//! persistent task executors. Otherwise the managers are built in
//! dependency order and the two persistent task executors are bound to
//! the same manager instances the rest of the node uses.

use std::path::PathBuf;
use std::sync::Arc;

use mlnode_reconcile::{DisabledReason, Eligibility};
use tokio::sync::watch;
use tracing::info;

use crate::audit::Auditor;
use crate::datafeed::{DataExtractor, DatafeedManager};
use crate::error::MlError;
use crate::jobs::JobManager;
use crate::persistent::{OpenJobExecutor, PersistentTaskExecutor, StartDatafeedExecutor};
use crate::pools::{PoolPlan, ThreadPools};
use crate::process::ProcessFactory;
use crate::process_manager::AnalyticsProcessManager;
use crate::settings::JobCapacityConfig;
use crate::storage::ResultsWriter;

/// What assembly needs from the node.
pub struct AssemblyInputs {
    pub eligibility: Eligibility,
    /// Whether jobs run the native analytics process.
    pub native_process: bool,
    /// Installation root holding the native controller.
    pub home: PathBuf,
    pub node_name: String,
    pub pool_plan: PoolPlan,
    pub capacity: watch::Receiver<JobCapacityConfig>,
    pub writer: Arc<dyn ResultsWriter>,
    pub extractor: Arc<dyn DataExtractor>,
    pub templates_ready: watch::Receiver<bool>,
}

/// Components of an ML-enabled node.
pub struct MlComponents {
    pub auditor: Arc<Auditor>,
    pub jobs: Arc<JobManager>,
    pub processes: Arc<AnalyticsProcessManager>,
    pub datafeeds: Arc<DatafeedManager>,
    pub factory: Arc<ProcessFactory>,
    pub pools: Arc<ThreadPools>,
    executors: Vec<Arc<dyn PersistentTaskExecutor>>,
}

pub enum MlAssembly {
    Disabled(DisabledReason),
    Enabled(MlComponents),
}

impl MlAssembly {
    pub fn assemble(inputs: AssemblyInputs) -> Result<Self, MlError> {
        if let Eligibility::Disabled(reason) = inputs.eligibility {
            if !inputs.eligibility.assembles_components() {
                info!(?reason, "ML disabled, no job scheduling components assembled");
                return Ok(MlAssembly::Disabled(reason));
            }
        }

        let factory = Arc::new(ProcessFactory::select(inputs.native_process, &inputs.home)?);
        let pools = Arc::new(ThreadPools::start(&inputs.pool_plan));

        let auditor = Arc::new(Auditor::new(
            Arc::clone(&inputs.writer),
            inputs.node_name.clone(),
            inputs.templates_ready,
        ));
        let jobs = Arc::new(JobManager::new(inputs.capacity, Arc::clone(&auditor)));
        let processes = Arc::new(AnalyticsProcessManager::new(
            Arc::clone(&jobs),
            Arc::clone(&factory),
            Arc::clone(&pools),
            inputs.writer,
            Arc::clone(&auditor),
            inputs.node_name,
        ));
        let datafeeds = Arc::new(DatafeedManager::new(
            Arc::clone(&jobs),
            Arc::clone(&processes),
            inputs.extractor,
            Arc::clone(&pools),
            Arc::clone(&auditor),
        ));

        let executors: Vec<Arc<dyn PersistentTaskExecutor>> = vec![
            Arc::new(OpenJobExecutor::new(Arc::clone(&processes))),
            Arc::new(StartDatafeedExecutor::new(Arc::clone(&datafeeds))),
        ];

        info!(
            native_process = factory.is_native(),
            eligibility = ?inputs.eligibility,
            "ML job scheduling components assembled"
        );

        Ok(MlAssembly::Enabled(MlComponents {
            auditor,
            jobs,
            processes,
            datafeeds,
            factory,
            pools,
            executors,
        }))
    }

    /// The persistent task executors to register; empty when disabled.
    pub fn persistent_task_executors(&self) -> Vec<Arc<dyn PersistentTaskExecutor>> {
        match self {
            MlAssembly::Disabled(_) => Vec::new(),
            MlAssembly::Enabled(components) => components.executors.clone(),
        }
    }

    pub fn components(&self) -> Option<&MlComponents> {
        match self {
            MlAssembly::Disabled(_) => None,
            MlAssembly::Enabled(components) => Some(components),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, MlAssembly::Enabled(_))
    }
}
