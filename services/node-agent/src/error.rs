//! Errors surfaced by the ML node service.

use mlnode_id::{DatafeedId, IdError, JobId};
use mlnode_reconcile::ReconcileError;
use mlnode_templates::StoreError;
use thiserror::Error;

use crate::pools::PoolError;
use crate::settings::{ByteSize, SettingsError};

/// Errors from ML node assembly and job management.
#[derive(Debug, Error)]
pub enum MlError {
    /// Node settings clash with the attributes ML publishes.
    #[error(transparent)]
    ConfigurationConflict(#[from] ReconcileError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// No working native process controller when one is required.
    #[error("capacity unavailable: {0}")]
    CapacityUnavailable(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    TemplateStore(#[from] StoreError),

    #[error("no known job with id [{0}]")]
    JobNotFound(JobId),

    #[error("no known datafeed with id [{0}]")]
    DatafeedNotFound(DatafeedId),

    #[error("job [{0}] already exists")]
    JobAlreadyExists(JobId),

    #[error("datafeed [{0}] already exists")]
    DatafeedAlreadyExists(DatafeedId),

    #[error("a datafeed [{datafeed_id}] already exists for job [{job_id}]")]
    JobHasDatafeed { job_id: JobId, datafeed_id: DatafeedId },

    #[error("invalid datafeed [{datafeed_id}]: {reason}")]
    InvalidDatafeed { datafeed_id: DatafeedId, reason: String },

    #[error("job [{0}] is already open on this node")]
    JobAlreadyOpen(JobId),

    #[error("job [{0}] is not open on this node")]
    JobNotOpen(JobId),

    #[error("datafeed [{0}] is already started")]
    DatafeedAlreadyStarted(DatafeedId),

    #[error("max number of open jobs [{max}] reached on this node")]
    TooManyOpenJobs { max: u32 },

    #[error("model memory limit [{requested}] exceeds the maximum [{max}]")]
    ModelMemoryLimitTooLarge { requested: ByteSize, max: ByteSize },

    #[error("analytics process for job [{job_id}] failed: {source}")]
    Process {
        job_id: JobId,
        source: anyhow::Error,
    },

    #[error("ML is not enabled on this node")]
    Disabled,
}

impl MlError {
    /// Whether the error must abort node startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MlError::ConfigurationConflict(_)
                | MlError::Settings(_)
                | MlError::CapacityUnavailable(_)
                | MlError::TemplateStore(_)
        )
    }
}
