use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::store::models::Task;

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    Completed,
    Failed { message: String },
    Cancelled,
}

/// Abstraction over the agent that does a task's work, for testability.
/// Real implementation: [`ProcessAgent`].
///
/// An `Err` means the runner itself broke (spawn failure, lost pipes) and is
/// treated like a crash by the supervisor.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        task: &Task,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<AgentExit>;
}

/// Runs an external command in the workspace with the task prompt as its
/// last argument.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    command: String,
    args: Vec<String>,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

/// Keep the tail of stderr for the failure message.
const STDERR_TAIL: usize = 2000;

#[async_trait]
impl AgentRunner for ProcessAgent {
    async fn run(
        &self,
        task: &Task,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<AgentExit> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(task.to_prompt())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", self.command))?;
        info!(task_id = task.id, command = %self.command, pid = child.id(), "agent started");

        let task_id = task.id;
        let stdout_reader = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id, "agent: {}", line);
                }
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for agent process")?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(task_id, error = %e, "failed to kill agent process");
                }
                info!(task_id, "agent cancelled");
                return Ok(AgentExit::Cancelled);
            }
        };

        if let Some(reader) = stdout_reader {
            let _ = reader.await;
        }
        let stderr = match stderr_reader {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            info!(task_id, "agent completed");
            return Ok(AgentExit::Completed);
        }

        let stderr = stderr.trim();
        let skip = stderr.chars().count().saturating_sub(STDERR_TAIL);
        let tail: String = stderr.chars().skip(skip).collect();
        let message = match status.code() {
            Some(code) if stderr.is_empty() => format!("agent exited with code {}", code),
            Some(code) => format!("agent exited with code {}: {}", code, tail),
            None => "agent terminated by signal".to_string(),
        };
        warn!(task_id, %message, "agent failed");
        Ok(AgentExit::Failed { message })
    }
}
