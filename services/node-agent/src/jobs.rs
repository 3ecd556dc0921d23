//! Job and datafeed catalog.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use mlnode_id::{DatafeedId, JobId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::audit::Auditor;
use crate::error::MlError;
use crate::settings::{ByteSize, JobCapacityConfig};

/// Model memory limit used when a job does not declare one.
pub const DEFAULT_MODEL_MEMORY_LIMIT: ByteSize = ByteSize::from_mb(1024);

const DEFAULT_BUCKET_SPAN_SECS: u64 = 300;
const DEFAULT_FREQUENCY_SECS: u64 = 150;
const DEFAULT_QUERY_DELAY_SECS: u64 = 60;

/// Longest query delay a datafeed may declare: one week.
pub const MAX_QUERY_DELAY_SECS: u64 = 7 * 24 * 60 * 60;

/// An anomaly detection job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: JobId,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_bucket_span_secs")]
    pub bucket_span_secs: u64,
    #[serde(default = "default_model_memory_limit")]
    pub model_memory_limit: ByteSize,
}

impl JobConfig {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            description: None,
            bucket_span_secs: DEFAULT_BUCKET_SPAN_SECS,
            model_memory_limit: DEFAULT_MODEL_MEMORY_LIMIT,
        }
    }

    pub fn with_model_memory_limit(mut self, limit: ByteSize) -> Self {
        self.model_memory_limit = limit;
        self
    }
}

/// Feeds search results into a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatafeedConfig {
    pub datafeed_id: DatafeedId,
    pub job_id: JobId,
    pub indices: Vec<String>,
    /// Seconds between searches in real-time mode.
    #[serde(default = "default_frequency_secs")]
    pub frequency_secs: u64,
    /// Seconds to lag behind now, allowing late documents to arrive.
    #[serde(default = "default_query_delay_secs")]
    pub query_delay_secs: u64,
}

impl DatafeedConfig {
    pub fn new(datafeed_id: DatafeedId, job_id: JobId, indices: Vec<String>) -> Self {
        Self {
            datafeed_id,
            job_id,
            indices,
            frequency_secs: DEFAULT_FREQUENCY_SECS,
            query_delay_secs: DEFAULT_QUERY_DELAY_SECS,
        }
    }
}

fn default_bucket_span_secs() -> u64 {
    DEFAULT_BUCKET_SPAN_SECS
}

fn default_model_memory_limit() -> ByteSize {
    DEFAULT_MODEL_MEMORY_LIMIT
}

fn default_frequency_secs() -> u64 {
    DEFAULT_FREQUENCY_SECS
}

fn default_query_delay_secs() -> u64 {
    DEFAULT_QUERY_DELAY_SECS
}

/// Registry of jobs and datafeeds known to this node.
pub struct JobManager {
    jobs: RwLock<HashMap<JobId, JobConfig>>,
    datafeeds: RwLock<HashMap<DatafeedId, DatafeedConfig>>,
    capacity: watch::Receiver<JobCapacityConfig>,
    auditor: Arc<Auditor>,
}

impl JobManager {
    pub fn new(capacity: watch::Receiver<JobCapacityConfig>, auditor: Arc<Auditor>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            datafeeds: RwLock::new(HashMap::new()),
            capacity,
            auditor,
        }
    }

    /// Register a job. The model memory limit must not exceed
    /// `ml.max_model_memory_limit` when that is set.
    pub async fn put_job(&self, job: JobConfig) -> Result<(), MlError> {
        let max = self.capacity.borrow().max_model_memory_limit;
        if !max.is_zero() && job.model_memory_limit > max {
            return Err(MlError::ModelMemoryLimitTooLarge {
                requested: job.model_memory_limit,
                max,
            });
        }

        let job_id = job.job_id.clone();
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
            if jobs.contains_key(&job_id) {
                return Err(MlError::JobAlreadyExists(job_id));
            }
            jobs.insert(job_id.clone(), job);
        }

        info!(job_id = %job_id, "Job created");
        self.auditor.info(job_id.as_str(), "Job created").await;
        Ok(())
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<JobConfig, MlError> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_id)
            .cloned()
            .ok_or_else(|| MlError::JobNotFound(job_id.clone()))
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Register a datafeed for an existing job. A job has at most one.
    pub async fn put_datafeed(&self, datafeed: DatafeedConfig) -> Result<(), MlError> {
        self.get_job(&datafeed.job_id)?;
        if datafeed.query_delay_secs > MAX_QUERY_DELAY_SECS {
            return Err(MlError::InvalidDatafeed {
                datafeed_id: datafeed.datafeed_id,
                reason: format!(
                    "query delay [{}s] exceeds the maximum [{MAX_QUERY_DELAY_SECS}s]",
                    datafeed.query_delay_secs
                ),
            });
        }

        let datafeed_id = datafeed.datafeed_id.clone();
        let job_id = datafeed.job_id.clone();
        {
            let mut datafeeds = self.datafeeds.write().unwrap_or_else(|p| p.into_inner());
            if datafeeds.contains_key(&datafeed_id) {
                return Err(MlError::DatafeedAlreadyExists(datafeed_id));
            }
            if let Some(existing) = datafeeds.values().find(|d| d.job_id == job_id) {
                return Err(MlError::JobHasDatafeed {
                    job_id,
                    datafeed_id: existing.datafeed_id.clone(),
                });
            }
            datafeeds.insert(datafeed_id.clone(), datafeed);
        }

        info!(datafeed_id = %datafeed_id, job_id = %job_id, "Datafeed created");
        Ok(())
    }

    pub fn get_datafeed(&self, datafeed_id: &DatafeedId) -> Result<DatafeedConfig, MlError> {
        self.datafeeds
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(datafeed_id)
            .cloned()
            .ok_or_else(|| MlError::DatafeedNotFound(datafeed_id.clone()))
    }

    /// Current capacity settings.
    pub fn capacity(&self) -> JobCapacityConfig {
        *self.capacity.borrow()
    }
}
