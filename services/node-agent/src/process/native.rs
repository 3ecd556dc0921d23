//! Native analytics binaries.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mlnode_id::JobId;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use super::{AnalyticsProcess, ProcessOutput};
use crate::error::MlError;
use crate::jobs::JobConfig;

/// Controller binary that must be present for native mode.
pub const CONTROLLER_NAME: &str = "controller";

const AUTODETECT_NAME: &str = "autodetect";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Platform directory name for the running OS and architecture, if native
/// binaries are built for it.
pub fn platform_name() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Some("linux-x86_64"),
        ("linux", "aarch64") => Some("linux-aarch64"),
        ("macos", "x86_64") => Some("darwin-x86_64"),
        ("macos", "aarch64") => Some("darwin-aarch64"),
        ("windows", "x86_64") => Some("windows-x86_64"),
        _ => None,
    }
}

/// Located native binaries.
#[derive(Debug, Clone)]
pub struct NativeController {
    bin_dir: PathBuf,
}

impl NativeController {
    /// Find the native binaries under `home/modules/ml/platform/<platform>/bin`.
    pub fn locate(home: &Path) -> Result<Self, MlError> {
        let platform = platform_name().ok_or_else(|| {
            MlError::CapacityUnavailable(format!(
                "native analytics is not supported on {}-{}; set ml.autodetect_process to false",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
        })?;

        let bin_dir = home
            .join("modules")
            .join("ml")
            .join("platform")
            .join(platform)
            .join("bin");
        let controller = bin_dir.join(CONTROLLER_NAME);
        if !controller.is_file() {
            return Err(MlError::CapacityUnavailable(format!(
                "native controller [{}] not found; set ml.autodetect_process to false",
                controller.display()
            )));
        }

        Ok(Self { bin_dir })
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Launch the analytics binary for a job.
    pub fn spawn_autodetect(&self, job: &JobConfig) -> Result<NativeProcess> {
        let program = self.bin_dir.join(AUTODETECT_NAME);
        let mut child = Command::new(&program)
            .arg(format!("--jobid={}", job.job_id))
            .arg(format!("--bucketspan={}", job.bucket_span_secs))
            .arg(format!("--modelmemorylimit={}", job.model_memory_limit.bytes() >> 20))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", program.display()))?;

        let stdin = child.stdin.take();
        info!(job_id = %job.job_id, pid = ?child.id(), "Native analytics process started");

        Ok(NativeProcess {
            job_id: job.job_id.clone(),
            child,
            stdin,
        })
    }
}

/// A running native analytics process. Records are written to its stdin
/// as newline-delimited JSON.
pub struct NativeProcess {
    job_id: JobId,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl NativeProcess {
    #[cfg(unix)]
    fn terminate(&self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: signalling a child we own by pid.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(job_id = %self.job_id, pid, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

#[async_trait]
impl AnalyticsProcess for NativeProcess {
    fn take_output(&mut self) -> Option<ProcessOutput> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::pin(stdout) as ProcessOutput)
    }

    async fn write_records(&mut self, records: &[Value]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            bail!("input to analytics process for job [{}] is closed", self.job_id);
        };
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            stdin.write_all(&line).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let waited = tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait()).await;
        match waited {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    bail!("analytics process for job [{}] exited with {status}", self.job_id);
                }
                Ok(())
            }
            Err(_) => {
                warn!(job_id = %self.job_id, "Analytics process did not exit after close, killing");
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> Result<()> {
        drop(self.stdin.take());
        self.terminate();
        if tokio::time::timeout(KILL_GRACE, self.child.wait()).await.is_err() {
            self.child.kill().await?;
        }
        debug!(job_id = %self.job_id, "Analytics process killed");
        Ok(())
    }
}
