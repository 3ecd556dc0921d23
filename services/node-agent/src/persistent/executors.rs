//! Executors for the two ML persistent tasks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mlnode_id::{DatafeedId, JobId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::placement::{select_node_for_datafeed, select_node_for_job, Assignment, ClusterView};
use super::{
    parse_params, PersistentTaskExecutor, TaskContext, TaskError, OPEN_JOB_TASK,
    START_DATAFEED_TASK,
};
use crate::datafeed::{DatafeedManager, DatafeedOutcome};
use crate::process_manager::{AnalyticsProcessManager, JobState};

/// Params of an open-job task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub job_id: JobId,
}

/// Params of a start-datafeed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatafeedParams {
    pub datafeed_id: DatafeedId,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// Keeps a job open on this node for as long as its task runs.
pub struct OpenJobExecutor {
    processes: Arc<AnalyticsProcessManager>,
}

impl OpenJobExecutor {
    pub fn new(processes: Arc<AnalyticsProcessManager>) -> Self {
        Self { processes }
    }

    pub fn processes(&self) -> &Arc<AnalyticsProcessManager> {
        &self.processes
    }
}

#[async_trait]
impl PersistentTaskExecutor for OpenJobExecutor {
    fn task_name(&self) -> &'static str {
        OPEN_JOB_TASK
    }

    fn select_node(&self, params: &Value, cluster: &ClusterView) -> Assignment {
        let params: JobParams = match parse_params(OPEN_JOB_TASK, params) {
            Ok(params) => params,
            Err(e) => return Assignment::Unassigned { reason: e.to_string() },
        };
        let jobs = self.processes.jobs();
        match jobs.get_job(&params.job_id) {
            Ok(job) => select_node_for_job(
                cluster,
                &job.job_id,
                job.model_memory_limit,
                &jobs.capacity(),
            ),
            Err(e) => Assignment::Unassigned { reason: e.to_string() },
        }
    }

    async fn execute(&self, params: Value, mut ctx: TaskContext) -> Result<(), TaskError> {
        let JobParams { job_id } = parse_params(OPEN_JOB_TASK, &params)?;
        let mut opened = self.processes.open_job(&job_id).await?;
        ctx.update_status(format!("job [{job_id}] opened"));

        let state = tokio::select! {
            state = opened.wait_finished() => state,
            _ = ctx.cancelled() => {
                info!(job_id = %job_id, task_id = %ctx.task_id(), "Open job task cancelled, killing process");
                self.processes.kill_job(&job_id);
                return match opened.wait_finished().await {
                    JobState::Failed => Err(TaskError::Failed(format!("job [{job_id}] failed while being killed"))),
                    _ => Ok(()),
                };
            }
        };

        match state {
            JobState::Closed => Ok(()),
            other => Err(TaskError::Failed(format!(
                "job [{job_id}] ended in state [{other}]"
            ))),
        }
    }

    fn force_stop(&self, params: &Value) {
        if let Ok(JobParams { job_id }) = parse_params(OPEN_JOB_TASK, params) {
            if self.processes.kill_job(&job_id) {
                warn!(job_id = %job_id, "Killed job left behind by aborted task");
            }
        }
    }
}

/// Runs a datafeed on the node holding its job.
pub struct StartDatafeedExecutor {
    datafeeds: Arc<DatafeedManager>,
}

impl StartDatafeedExecutor {
    pub fn new(datafeeds: Arc<DatafeedManager>) -> Self {
        Self { datafeeds }
    }

    pub fn datafeeds(&self) -> &Arc<DatafeedManager> {
        &self.datafeeds
    }
}

#[async_trait]
impl PersistentTaskExecutor for StartDatafeedExecutor {
    fn task_name(&self) -> &'static str {
        START_DATAFEED_TASK
    }

    fn select_node(&self, params: &Value, cluster: &ClusterView) -> Assignment {
        let params: DatafeedParams = match parse_params(START_DATAFEED_TASK, params) {
            Ok(params) => params,
            Err(e) => return Assignment::Unassigned { reason: e.to_string() },
        };
        match self.datafeeds.jobs().get_datafeed(&params.datafeed_id) {
            Ok(datafeed) => select_node_for_datafeed(cluster, &datafeed.job_id),
            Err(e) => Assignment::Unassigned { reason: e.to_string() },
        }
    }

    async fn execute(&self, params: Value, mut ctx: TaskContext) -> Result<(), TaskError> {
        let DatafeedParams {
            datafeed_id,
            start,
            end,
        } = parse_params(START_DATAFEED_TASK, &params)?;
        let mut running = self
            .datafeeds
            .start_datafeed(&datafeed_id, start, end)
            .await?;
        ctx.update_status(format!("datafeed [{datafeed_id}] started"));

        let outcome = tokio::select! {
            outcome = running.wait() => outcome,
            _ = ctx.cancelled() => {
                self.datafeeds.stop_datafeed(&datafeed_id);
                running.wait().await
            }
        };

        match outcome {
            DatafeedOutcome::Finished | DatafeedOutcome::Stopped => Ok(()),
            DatafeedOutcome::Failed => Err(TaskError::Failed(format!(
                "datafeed [{datafeed_id}] could not post data to its job"
            ))),
        }
    }

    fn force_stop(&self, params: &Value) {
        if let Ok(DatafeedParams { datafeed_id, .. }) = parse_params(START_DATAFEED_TASK, params) {
            self.datafeeds.stop_datafeed(&datafeed_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Auditor;
    use crate::datafeed::EmptyExtractor;
    use crate::jobs::{DatafeedConfig, JobConfig, JobManager};
    use crate::persistent::{PersistentTasksNodeService, TaskAssignment, TaskStatus};
    use crate::pools::{PoolPlan, ThreadPools};
    use crate::process::ProcessFactory;
    use crate::settings::{DynamicSettings, JobCapacityConfig};
    use crate::storage::InMemoryResultsWriter;
    use mlnode_id::{AllocationId, NodeId, TaskId};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Fixture {
        service: PersistentTasksNodeService,
        processes: Arc<AnalyticsProcessManager>,
        datafeeds: Arc<DatafeedManager>,
    }

    async fn fixture() -> Fixture {
        let settings = DynamicSettings::new(JobCapacityConfig::default());
        let writer = Arc::new(InMemoryResultsWriter::new());
        let (_tx, ready) = watch::channel(true);
        let auditor = Arc::new(Auditor::new(writer.clone(), "node-1", ready));
        let jobs = Arc::new(JobManager::new(settings.subscribe(), auditor.clone()));
        jobs.put_job(JobConfig::new(JobId::parse("farequote").unwrap()))
            .await
            .unwrap();
        jobs.put_datafeed(DatafeedConfig::new(
            DatafeedId::parse("feed").unwrap(),
            JobId::parse("farequote").unwrap(),
            vec!["airline-data".to_string()],
        ))
        .await
        .unwrap();

        let pools = Arc::new(ThreadPools::start(&PoolPlan::for_max_open_jobs(2)));
        let processes = Arc::new(AnalyticsProcessManager::new(
            jobs.clone(),
            Arc::new(ProcessFactory::NoOp),
            pools.clone(),
            writer,
            auditor.clone(),
            "node-1",
        ));
        let datafeeds = Arc::new(DatafeedManager::new(
            jobs,
            processes.clone(),
            Arc::new(EmptyExtractor),
            pools,
            auditor,
        ));
        let service = PersistentTasksNodeService::new(
            NodeId::new(),
            vec![
                Arc::new(OpenJobExecutor::new(processes.clone())),
                Arc::new(StartDatafeedExecutor::new(datafeeds.clone())),
            ],
            Duration::from_secs(5),
        );
        Fixture {
            service,
            processes,
            datafeeds,
        }
    }

    fn assign(service: &PersistentTasksNodeService, task_name: &str, params: Value) -> TaskAssignment {
        TaskAssignment {
            task_id: TaskId::new(),
            allocation_id: AllocationId::new(0),
            task_name: task_name.to_string(),
            params,
            executor_node: service.node_id(),
        }
    }

    fn job_id() -> JobId {
        JobId::parse("farequote").unwrap()
    }

    #[tokio::test]
    async fn test_open_job_task_runs_until_cancelled() {
        let f = fixture().await;
        let task = assign(&f.service, OPEN_JOB_TASK, json!({"job_id": "farequote"}));
        let task_id = task.task_id;
        let mut status = f.service.start_task(task).unwrap();

        status
            .wait_for(|s| matches!(s, TaskStatus::Running { .. }))
            .await
            .unwrap();
        assert_eq!(f.processes.job_state(&job_id()), Some(JobState::Opened));

        assert_eq!(f.service.cancel_task(&task_id).await.unwrap(), TaskStatus::Cancelled);
        assert_eq!(f.processes.open_job_count(), 0);
    }

    #[tokio::test]
    async fn test_open_job_task_completes_on_close() {
        let f = fixture().await;
        let mut status = f
            .service
            .start_task(assign(&f.service, OPEN_JOB_TASK, json!({"job_id": "farequote"})))
            .unwrap();
        status
            .wait_for(|s| matches!(s, TaskStatus::Running { .. }))
            .await
            .unwrap();

        f.processes.close_job(&job_id()).await.unwrap();
        let finished = status.wait_for(TaskStatus::is_terminal).await.unwrap().clone();
        assert_eq!(finished, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_open_job_task_unknown_job_fails() {
        let f = fixture().await;
        let mut status = f
            .service
            .start_task(assign(&f.service, OPEN_JOB_TASK, json!({"job_id": "missing"})))
            .unwrap();
        let finished = status.wait_for(TaskStatus::is_terminal).await.unwrap().clone();
        assert!(matches!(finished, TaskStatus::Failed { reason } if reason.contains("missing")));
    }

    #[tokio::test]
    async fn test_invalid_params_fail_task() {
        let f = fixture().await;
        let mut status = f
            .service
            .start_task(assign(&f.service, OPEN_JOB_TASK, json!({"job": 1})))
            .unwrap();
        let finished = status.wait_for(TaskStatus::is_terminal).await.unwrap().clone();
        assert!(matches!(finished, TaskStatus::Failed { reason } if reason.contains("open-job")));
    }

    #[tokio::test]
    async fn test_datafeed_task_lookback_completes() {
        let f = fixture().await;
        let mut job = f
            .service
            .start_task(assign(&f.service, OPEN_JOB_TASK, json!({"job_id": "farequote"})))
            .unwrap();
        job.wait_for(|s| matches!(s, TaskStatus::Running { .. }))
            .await
            .unwrap();

        let end = Utc::now() - chrono::Duration::minutes(5);
        let params = serde_json::to_value(DatafeedParams {
            datafeed_id: DatafeedId::parse("feed").unwrap(),
            start: end - chrono::Duration::hours(1),
            end: Some(end),
        })
        .unwrap();
        let mut feed = f
            .service
            .start_task(assign(&f.service, START_DATAFEED_TASK, params))
            .unwrap();
        let finished = feed.wait_for(TaskStatus::is_terminal).await.unwrap().clone();
        assert_eq!(finished, TaskStatus::Completed);
        assert_eq!(f.datafeeds.running_count(), 0);

        f.service.shutdown().await;
        assert_eq!(f.processes.open_job_count(), 0);
    }

    #[tokio::test]
    async fn test_datafeed_task_needs_open_job() {
        let f = fixture().await;
        let params = json!({"datafeed_id": "feed", "start": "2024-01-01T00:00:00Z"});
        let mut feed = f
            .service
            .start_task(assign(&f.service, START_DATAFEED_TASK, params))
            .unwrap();
        let finished = feed.wait_for(TaskStatus::is_terminal).await.unwrap().clone();
        assert!(matches!(finished, TaskStatus::Failed { reason } if reason.contains("not open")));
    }

    #[tokio::test]
    async fn test_select_node_unknown_job() {
        let f = fixture().await;
        let assignment = f
            .service
            .select_node(OPEN_JOB_TASK, &json!({"job_id": "missing"}), &ClusterView::default())
            .unwrap();
        assert!(matches!(assignment, Assignment::Unassigned { .. }));
    }
}
