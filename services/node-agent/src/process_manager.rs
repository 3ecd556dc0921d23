//! Runs analytics processes for the jobs opened on this node.
//!
//! Every open job gets a supervision loop on the autodetect pool that owns
//! the process and serves commands from the job's mailbox, plus a results
//! processor on the utility pool that persists what the process emits.
//! The number of open jobs is admission-controlled against
//! `ml.max_open_jobs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use mlnode_id::JobId;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::audit::Auditor;
use crate::error::MlError;
use crate::jobs::JobManager;
use crate::pools::ThreadPools;
use crate::process::{AnalyticsProcess, ProcessFactory, ProcessOutput};
use crate::storage::{ResultsWriter, SHARED_RESULTS_INDEX};

/// Commands a job's mailbox holds before senders wait.
pub const JOB_MAILBOX_CAPACITY: usize = 64;

/// Lifecycle of an open job on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Opening,
    Opened,
    Closing,
    Closed,
    Killed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Closed | JobState::Killed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Opening => "opening",
            JobState::Opened => "opened",
            JobState::Closing => "closing",
            JobState::Closed => "closed",
            JobState::Killed => "killed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input accounting for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataCounts {
    pub input_record_count: u64,
    pub processed_record_count: u64,
    pub invalid_record_count: u64,
    pub input_bytes: u64,
}

enum JobCommand {
    PostData {
        records: Vec<Value>,
        reply: oneshot::Sender<anyhow::Result<DataCounts>>,
    },
    Flush {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Close {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Sends commands to an open job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    tx: mpsc::Sender<JobCommand>,
}

impl JobHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Send records to the process. Only JSON objects are analysed; other
    /// values are counted as invalid.
    pub async fn post_data(&self, records: Vec<Value>) -> Result<DataCounts, MlError> {
        self.request(|reply| JobCommand::PostData { records, reply })
            .await
    }

    pub async fn flush(&self) -> Result<(), MlError> {
        self.request(|reply| JobCommand::Flush { reply }).await
    }

    /// Close the job and wait for its process to exit.
    pub async fn close(&self) -> Result<(), MlError> {
        self.request(|reply| JobCommand::Close { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<anyhow::Result<T>>) -> JobCommand,
    ) -> Result<T, MlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| MlError::JobNotOpen(self.job_id.clone()))?;
        rx.await
            .map_err(|_| MlError::JobNotOpen(self.job_id.clone()))?
            .map_err(|source| MlError::Process {
                job_id: self.job_id.clone(),
                source,
            })
    }
}

/// A job opened by [`AnalyticsProcessManager::open_job`].
#[derive(Debug)]
pub struct OpenedJob {
    pub handle: JobHandle,
    state: watch::Receiver<JobState>,
}

impl OpenedJob {
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Wait until the job is closed, killed or failed.
    pub async fn wait_finished(&mut self) -> JobState {
        let finished = self
            .state
            .wait_for(JobState::is_terminal)
            .await
            .map(|state| *state);
        finished.unwrap_or_else(|_| *self.state.borrow())
    }
}

struct OpenJobEntry {
    handle: JobHandle,
    kill: watch::Sender<bool>,
    state: watch::Receiver<JobState>,
}

type OpenJobs = Arc<Mutex<HashMap<JobId, OpenJobEntry>>>;

/// Holds a job's admission slot until dropped.
struct Registration {
    open: OpenJobs,
    job_id: JobId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.job_id);
    }
}

pub struct AnalyticsProcessManager {
    jobs: Arc<JobManager>,
    factory: Arc<ProcessFactory>,
    pools: Arc<ThreadPools>,
    writer: Arc<dyn ResultsWriter>,
    auditor: Arc<Auditor>,
    node_name: String,
    open: OpenJobs,
}

impl AnalyticsProcessManager {
    pub fn new(
        jobs: Arc<JobManager>,
        factory: Arc<ProcessFactory>,
        pools: Arc<ThreadPools>,
        writer: Arc<dyn ResultsWriter>,
        auditor: Arc<Auditor>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            factory,
            pools,
            writer,
            auditor,
            node_name: node_name.into(),
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn factory(&self) -> &Arc<ProcessFactory> {
        &self.factory
    }

    /// Open a job on this node: admit it, start its process and hand the
    /// process to a supervision loop.
    pub async fn open_job(&self, job_id: &JobId) -> Result<OpenedJob, MlError> {
        let job = self.jobs.get_job(job_id)?;
        let max_open_jobs = self.jobs.capacity().max_open_jobs_per_node;

        let (tx, commands) = mpsc::channel(JOB_MAILBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(JobState::Opening);
        let (kill_tx, kill_rx) = watch::channel(false);
        let handle = JobHandle {
            job_id: job_id.clone(),
            tx,
        };

        let registration = {
            let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            if open.contains_key(job_id) {
                return Err(MlError::JobAlreadyOpen(job_id.clone()));
            }
            if open.len() >= max_open_jobs as usize {
                return Err(MlError::TooManyOpenJobs { max: max_open_jobs });
            }
            open.insert(
                job_id.clone(),
                OpenJobEntry {
                    handle: handle.clone(),
                    kill: kill_tx,
                    state: state_rx.clone(),
                },
            );
            Registration {
                open: Arc::clone(&self.open),
                job_id: job_id.clone(),
            }
        };

        info!(job_id = %job_id, "Opening job");
        self.auditor
            .info(job_id.as_str(), format!("Opening job on node [{}]", self.node_name))
            .await;

        let mut process = match self.factory.spawn(&job).await {
            Ok(process) => process,
            Err(source) => {
                drop(registration);
                error!(job_id = %job_id, error = %source, "Failed to start analytics process");
                self.auditor
                    .error(job_id.as_str(), format!("Failed to start process: {source}"))
                    .await;
                return Err(MlError::Process {
                    job_id: job_id.clone(),
                    source,
                });
            }
        };

        if let Some(output) = process.take_output() {
            let results = process_results(job_id.clone(), output, Arc::clone(&self.writer));
            self.pools.utility.try_submit(results)?;
        }

        let supervisor = JobSupervisor {
            job_id: job_id.clone(),
            process,
            commands,
            kill: kill_rx,
            state: state_tx,
            writer: Arc::clone(&self.writer),
            auditor: Arc::clone(&self.auditor),
            registration,
            counts: DataCounts::default(),
        };
        self.pools.autodetect.try_submit(supervisor.run())?;

        Ok(OpenedJob {
            handle,
            state: state_rx,
        })
    }

    /// Handle to a job open on this node.
    pub fn handle(&self, job_id: &JobId) -> Option<JobHandle> {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn close_job(&self, job_id: &JobId) -> Result<(), MlError> {
        let handle = self
            .handle(job_id)
            .ok_or_else(|| MlError::JobNotOpen(job_id.clone()))?;
        handle.close().await
    }

    /// Kill a job's process without closing it cleanly. Returns false if
    /// the job is not open here.
    pub fn kill_job(&self, job_id: &JobId) -> bool {
        let open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        match open.get(job_id) {
            Some(entry) => {
                entry.kill.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn job_state(&self, job_id: &JobId) -> Option<JobState> {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_id)
            .map(|entry| *entry.state.borrow())
    }

    pub fn open_job_count(&self) -> usize {
        self.open.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Close every open job, waiting for each.
    pub async fn close_all(&self) {
        let handles: Vec<_> = self
            .open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        for handle in handles {
            if let Err(e) = handle.close().await {
                warn!(job_id = %handle.job_id(), error = %e, "Failed to close job during shutdown");
            }
        }
    }
}

/// Owns one job's process for its whole lifetime.
struct JobSupervisor {
    job_id: JobId,
    process: Box<dyn AnalyticsProcess>,
    commands: mpsc::Receiver<JobCommand>,
    kill: watch::Receiver<bool>,
    state: watch::Sender<JobState>,
    writer: Arc<dyn ResultsWriter>,
    auditor: Arc<Auditor>,
    registration: Registration,
    counts: DataCounts,
}

impl JobSupervisor {
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    async fn run(mut self) {
        self.state.send_replace(JobState::Opened);
        info!("Job opened");

        let final_state = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(JobCommand::PostData { records, reply }) => {
                        let result = self.post_data(records).await;
                        let _ = reply.send(result);
                    }
                    Some(JobCommand::Flush { reply }) => {
                        let _ = reply.send(self.process.flush().await);
                    }
                    Some(JobCommand::Close { reply }) => {
                        self.state.send_replace(JobState::Closing);
                        let result = self.process.close().await;
                        let state = if result.is_ok() { JobState::Closed } else { JobState::Failed };
                        persist_data_counts(self.writer.as_ref(), &self.job_id, self.counts).await;
                        let _ = reply.send(result);
                        break state;
                    }
                    None => {
                        self.state.send_replace(JobState::Closing);
                        if let Err(e) = self.process.close().await {
                            warn!(error = %e, "Failed to close process");
                        }
                        persist_data_counts(self.writer.as_ref(), &self.job_id, self.counts).await;
                        break JobState::Closed;
                    }
                },
                changed = self.kill.changed() => {
                    if changed.is_err() || *self.kill.borrow() {
                        if let Err(e) = self.process.kill().await {
                            warn!(error = %e, "Failed to kill process");
                        }
                        persist_data_counts(self.writer.as_ref(), &self.job_id, self.counts).await;
                        break JobState::Killed;
                    }
                }
            }
        };

        match final_state {
            JobState::Closed => self.auditor.info(self.job_id.as_str(), "Job closed").await,
            JobState::Killed => {
                self.auditor
                    .warning(self.job_id.as_str(), "Job process killed")
                    .await
            }
            _ => {
                self.auditor
                    .error(self.job_id.as_str(), "Job failed while closing")
                    .await
            }
        }
        info!(state = ?final_state, "Job finished");

        let JobSupervisor {
            state,
            registration,
            ..
        } = self;
        drop(registration);
        state.send_replace(final_state);
    }

    async fn post_data(&mut self, records: Vec<Value>) -> anyhow::Result<DataCounts> {
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            self.counts.input_record_count += 1;
            self.counts.input_bytes += serde_json::to_vec(&record)?.len() as u64;
            if record.is_object() {
                valid.push(record);
            } else {
                self.counts.invalid_record_count += 1;
            }
        }

        self.process.write_records(&valid).await?;
        self.counts.processed_record_count += valid.len() as u64;
        Ok(self.counts)
    }
}

/// Write a job's final data counts to the shared results index.
///
/// Takes the supervisor's parts: the process it owns is not `Sync`, so the
/// supervisor must not be borrowed across an await.
async fn persist_data_counts(writer: &dyn ResultsWriter, job_id: &JobId, counts: DataCounts) {
    let mut document = json!({
        "job_id": job_id,
        "result_type": "data_counts",
        "timestamp": Utc::now(),
    });
    if let (Value::Object(doc), Ok(Value::Object(counts))) =
        (&mut document, serde_json::to_value(counts))
    {
        doc.extend(counts);
    }
    if let Err(e) = writer.write(SHARED_RESULTS_INDEX, document).await {
        warn!(job_id = %job_id, error = %e, "Failed to persist data counts");
    }
}

/// Persist result documents emitted by a process until its output closes.
async fn process_results(job_id: JobId, output: ProcessOutput, writer: Arc<dyn ResultsWriter>) {
    let mut lines = BufReader::new(output).lines();
    let mut written = 0u64;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Error reading process output");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(mut document)) => {
                document.insert("job_id".to_string(), json!(job_id));
                match writer.write(SHARED_RESULTS_INDEX, Value::Object(document)).await {
                    Ok(()) => written += 1,
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to persist result"),
                }
            }
            _ => warn!(job_id = %job_id, "Ignoring unparseable process output"),
        }
    }
    debug!(job_id = %job_id, written, "Results processor finished");
}
