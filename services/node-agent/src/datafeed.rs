//! Datafeeds: pull data on a schedule and post it to an open job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use mlnode_id::DatafeedId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::audit::Auditor;
use crate::error::MlError;
use crate::jobs::{DatafeedConfig, JobManager};
use crate::pools::ThreadPools;
use crate::process_manager::{AnalyticsProcessManager, JobHandle};

/// Fetches the records a datafeed sees in a time range.
#[async_trait]
pub trait DataExtractor: Send + Sync {
    async fn extract(
        &self,
        datafeed: &DatafeedConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>>;
}

/// Extractor for nodes with no data source wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyExtractor;

#[async_trait]
impl DataExtractor for EmptyExtractor {
    async fn extract(
        &self,
        _datafeed: &DatafeedConfig,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// How a datafeed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatafeedOutcome {
    /// Reached its end time.
    Finished,
    Stopped,
    /// The job stopped accepting data.
    Failed,
}

/// A datafeed started by [`DatafeedManager::start_datafeed`].
pub struct RunningDatafeed {
    pub datafeed_id: DatafeedId,
    outcome: watch::Receiver<Option<DatafeedOutcome>>,
}

impl RunningDatafeed {
    pub async fn wait(&mut self) -> DatafeedOutcome {
        let outcome = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| *outcome);
        match outcome {
            Ok(Some(outcome)) => outcome,
            _ => DatafeedOutcome::Failed,
        }
    }
}

type RunningDatafeeds = Arc<Mutex<HashMap<DatafeedId, watch::Sender<bool>>>>;

struct Registration {
    running: RunningDatafeeds,
    datafeed_id: DatafeedId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.datafeed_id);
    }
}

pub struct DatafeedManager {
    jobs: Arc<JobManager>,
    processes: Arc<AnalyticsProcessManager>,
    extractor: Arc<dyn DataExtractor>,
    pools: Arc<ThreadPools>,
    auditor: Arc<Auditor>,
    running: RunningDatafeeds,
}

impl DatafeedManager {
    pub fn new(
        jobs: Arc<JobManager>,
        processes: Arc<AnalyticsProcessManager>,
        extractor: Arc<dyn DataExtractor>,
        pools: Arc<ThreadPools>,
        auditor: Arc<Auditor>,
    ) -> Self {
        Self {
            jobs,
            processes,
            extractor,
            pools,
            auditor,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn processes(&self) -> &Arc<AnalyticsProcessManager> {
        &self.processes
    }

    /// Start feeding data from `start`. With an `end` the datafeed stops
    /// once it has covered the range; without one it runs in real time
    /// until stopped. The datafeed's job must be open on this node.
    pub async fn start_datafeed(
        &self,
        datafeed_id: &DatafeedId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<RunningDatafeed, MlError> {
        let datafeed = self.jobs.get_datafeed(datafeed_id)?;
        let handle = self
            .processes
            .handle(&datafeed.job_id)
            .ok_or_else(|| MlError::JobNotOpen(datafeed.job_id.clone()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let registration = {
            let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
            if running.contains_key(datafeed_id) {
                return Err(MlError::DatafeedAlreadyStarted(datafeed_id.clone()));
            }
            running.insert(datafeed_id.clone(), stop_tx);
            Registration {
                running: Arc::clone(&self.running),
                datafeed_id: datafeed_id.clone(),
            }
        };

        let job_id = datafeed.job_id.clone();
        let run = DatafeedRun {
            datafeed,
            handle,
            extractor: Arc::clone(&self.extractor),
            auditor: Arc::clone(&self.auditor),
            stop: stop_rx,
            outcome: outcome_tx,
            registration,
            start,
            end,
        };
        self.pools.datafeed.try_submit(run.run())?;

        let range_end = end.map_or_else(|| "real-time".to_string(), |e| e.to_rfc3339());
        info!(datafeed_id = %datafeed_id, job_id = %job_id, start = %start, end = %range_end, "Datafeed started");
        self.auditor
            .info(
                job_id.as_str(),
                format!("Datafeed started (from: {} to: {range_end})", start.to_rfc3339()),
            )
            .await;

        Ok(RunningDatafeed {
            datafeed_id: datafeed_id.clone(),
            outcome: outcome_rx,
        })
    }

    /// Ask a datafeed to stop. Returns false if it is not running.
    pub fn stop_datafeed(&self, datafeed_id: &DatafeedId) -> bool {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        match running.get(datafeed_id) {
            Some(stop) => {
                stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, datafeed_id: &DatafeedId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(datafeed_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn stop_all(&self) {
        for stop in self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
        {
            stop.send_replace(true);
        }
    }
}

struct DatafeedRun {
    datafeed: DatafeedConfig,
    handle: JobHandle,
    extractor: Arc<dyn DataExtractor>,
    auditor: Arc<Auditor>,
    stop: watch::Receiver<bool>,
    outcome: watch::Sender<Option<DatafeedOutcome>>,
    registration: Registration,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

impl DatafeedRun {
    #[instrument(skip(self), fields(datafeed_id = %self.datafeed.datafeed_id))]
    async fn run(mut self) {
        let frequency = Duration::from_secs(self.datafeed.frequency_secs.max(1));
        let job_id = self.datafeed.job_id.clone();
        let mut cursor = self.start;

        let outcome = loop {
            let now = search_horizon(Utc::now(), self.datafeed.query_delay_secs);
            let search_end = self.end.map_or(now, |end| end.min(now));

            if search_end > cursor {
                match self.extractor.extract(&self.datafeed, cursor, search_end).await {
                    Ok(records) if records.is_empty() => cursor = search_end,
                    Ok(records) => {
                        if let Err(e) = self.handle.post_data(records).await {
                            error!(error = %e, "Datafeed could not post data to job");
                            self.auditor
                                .error(job_id.as_str(), format!("Datafeed is stopping: {e}"))
                                .await;
                            break DatafeedOutcome::Failed;
                        }
                        cursor = search_end;
                    }
                    Err(e) => {
                        warn!(error = %e, "Datafeed extraction failed, retrying");
                        self.auditor
                            .warning(job_id.as_str(), format!("Datafeed search failed: {e}"))
                            .await;
                    }
                }
            }

            if self.end.is_some_and(|end| cursor >= end) {
                if let Err(e) = self.handle.flush().await {
                    warn!(error = %e, "Failed to flush job after lookback");
                }
                break DatafeedOutcome::Finished;
            }

            tokio::select! {
                _ = tokio::time::sleep(frequency) => {}
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break DatafeedOutcome::Stopped;
                    }
                }
            }
        };

        info!(outcome = ?outcome, "Datafeed finished");
        self.auditor
            .info(job_id.as_str(), format!("Datafeed {outcome:?}"))
            .await;

        let DatafeedRun {
            outcome: outcome_tx,
            registration,
            ..
        } = self;
        drop(registration);
        outcome_tx.send_replace(Some(outcome));
    }
}

/// The latest time a search may cover: `now` lagged by the query delay.
fn search_horizon(now: DateTime<Utc>, query_delay_secs: u64) -> DateTime<Utc> {
    i64::try_from(query_delay_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delay| now.checked_sub_signed(delay))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
