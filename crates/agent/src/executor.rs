use async_trait::async_trait;
use farm_core::config::ExecutorConfig;
use farm_core::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything a payload runner needs for one hosted job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_guid: Uuid,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub payload: serde_json::Value,
}

/// Runs job payloads on this machine. The farm treats the payload as
/// opaque; it only moves channels in and out.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<()>;
}

/// Refuses every job. Installed when no executor command is configured.
pub struct NoExecutor;

#[async_trait]
impl JobExecutor for NoExecutor {
    fn is_available(&self) -> bool {
        false
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<()> {
        Err(Error::Job(format!(
            "job {} refused: no executor configured",
            request.job_guid
        )))
    }
}

/// Spawns the configured command with the job's directories in its
/// environment.
pub struct ProcessExecutor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Option<Self> {
        let command = config.command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }
        Some(Self::new(
            command,
            config.args.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        ))
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<()> {
        tokio::fs::create_dir_all(&request.input_dir).await?;
        tokio::fs::create_dir_all(&request.output_dir).await?;
        let payload_path = request.input_dir.join("payload.json");
        tokio::fs::write(&payload_path, serde_json::to_vec(&request.payload)?).await?;

        info!(job = %request.job_guid, command = %self.command, "Executing job");
        let child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .env("FARM_JOB_GUID", request.job_guid.to_string())
            .env("FARM_INPUT_DIR", &request.input_dir)
            .env("FARM_OUTPUT_DIR", &request.output_dir)
            .env("FARM_JOB_PAYLOAD", &payload_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Job(format!("failed to spawn {}: {}", self.command, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Job(format!("timed out after {}s", self.timeout.as_secs())))??;

        if output.status.success() {
            debug!(job = %request.job_guid, "Executor finished");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.chars().rev().take(512).collect::<Vec<_>>().into_iter().rev().collect();
        Err(Error::Job(format!("exit {}: {}", output.status, tail.trim())))
    }
}
