//! Analytics process abstraction and factory selection.
//!
//! The node either launches the native analytics binary for every opened
//! job or, when the native process is switched off, a no-op stand-in that
//! accepts and discards input. The choice is made once when ML is assembled.

mod blackhole;
mod native;

use std::path::Path;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncRead;
use tracing::info;

use crate::error::MlError;
use crate::jobs::JobConfig;

pub use blackhole::BlackHoleProcess;
pub use native::{platform_name, NativeController, NativeProcess, CONTROLLER_NAME};

/// Result documents written by a process, one JSON object per line.
pub type ProcessOutput = Pin<Box<dyn AsyncRead + Send>>;

/// A running analytics process for one job.
#[async_trait]
pub trait AnalyticsProcess: Send {
    /// Take the process's result stream. Returns `None` once taken.
    fn take_output(&mut self) -> Option<ProcessOutput>;

    /// Send input records.
    async fn write_records(&mut self, records: &[Value]) -> Result<()>;

    /// Ask the process to emit results for everything written so far.
    async fn flush(&mut self) -> Result<()>;

    /// Close input and wait for the process to finish.
    async fn close(&mut self) -> Result<()>;

    /// Terminate the process without waiting for pending input.
    async fn kill(&mut self) -> Result<()>;
}

/// How analytics processes are created on this node.
#[derive(Debug)]
pub enum ProcessFactory {
    Native(NativeController),
    NoOp,
}

impl ProcessFactory {
    /// Choose the factory for this node.
    ///
    /// With the native process enabled, an unsupported platform or a
    /// missing controller binary is fatal.
    pub fn select(native_process: bool, home: &Path) -> Result<Self, MlError> {
        if !native_process {
            info!("Native analytics process disabled, using no-op processes");
            return Ok(ProcessFactory::NoOp);
        }
        let controller = NativeController::locate(home)?;
        info!(bin_dir = %controller.bin_dir().display(), "Native analytics controller located");
        Ok(ProcessFactory::Native(controller))
    }

    pub fn is_native(&self) -> bool {
        matches!(self, ProcessFactory::Native(_))
    }

    /// Start a process for `job`.
    pub async fn spawn(&self, job: &JobConfig) -> Result<Box<dyn AnalyticsProcess>> {
        match self {
            ProcessFactory::Native(controller) => Ok(Box::new(controller.spawn_autodetect(job)?)),
            ProcessFactory::NoOp => Ok(Box::new(BlackHoleProcess::new(job.job_id.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_noop_when_native_disabled() {
        let factory = ProcessFactory::select(false, Path::new("/nonexistent")).unwrap();
        assert!(!factory.is_native());
    }

    #[test]
    fn test_select_native_without_controller_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessFactory::select(true, dir.path()).unwrap_err();
        assert!(matches!(err, MlError::CapacityUnavailable(_)));
        assert!(err.is_fatal());
    }
}
