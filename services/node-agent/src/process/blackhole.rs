use anyhow::{bail, Result};
use async_trait::async_trait;
use mlnode_id::JobId;
use serde_json::Value;

use super::{AnalyticsProcess, ProcessOutput};

/// Stand-in used when the native process is disabled: accepts input and
/// produces no results.
#[derive(Debug)]
pub struct BlackHoleProcess {
    job_id: JobId,
    records_written: u64,
    open: bool,
    output_taken: bool,
}

impl BlackHoleProcess {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            records_written: 0,
            open: true,
            output_taken: false,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open {
            bail!("process for job [{}] is closed", self.job_id);
        }
        Ok(())
    }
}

#[async_trait]
impl AnalyticsProcess for BlackHoleProcess {
    fn take_output(&mut self) -> Option<ProcessOutput> {
        if self.output_taken {
            return None;
        }
        self.output_taken = true;
        Some(Box::pin(tokio::io::empty()))
    }

    async fn write_records(&mut self, records: &[Value]) -> Result<()> {
        self.ensure_open()?;
        self.records_written += records.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_discards_input_until_closed() {
        let mut process = BlackHoleProcess::new(JobId::parse("farequote").unwrap());
        process.write_records(&[json!({"a": 1}), json!({"a": 2})]).await.unwrap();
        process.flush().await.unwrap();
        assert_eq!(process.records_written(), 2);

        process.close().await.unwrap();
        assert!(process.write_records(&[json!({})]).await.is_err());
    }

    #[tokio::test]
    async fn test_output_is_empty_and_taken_once() {
        use tokio::io::AsyncReadExt;

        let mut process = BlackHoleProcess::new(JobId::parse("farequote").unwrap());
        let mut output = process.take_output().unwrap();
        let mut buf = Vec::new();
        assert_eq!(output.read_to_end(&mut buf).await.unwrap(), 0);
        assert!(process.take_output().is_none());
    }
}
