use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Path of the main repository checkout shared by sequential tasks.
    pub path: String,
    pub default_target_branch: String,
    pub queue_halted: bool,
    pub halted_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "inprogress",
            Self::InReview => "inreview",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Done and cancelled tasks have left the queue for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "inprogress" => Ok(Self::InProgress),
            "inreview" => Ok(Self::InReview),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub execution_mode: ExecutionMode,
    pub queue_position: Option<i64>,
    pub target_branch: String,
    pub task_branch: Option<String>,
    /// Bumped on every write; queue mutations compare-and-swap on it.
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Sequential, still todo, and holding a queue slot.
    pub fn is_pending(&self) -> bool {
        self.execution_mode == ExecutionMode::Sequential
            && self.status == TaskStatus::Todo
            && self.queue_position.is_some()
    }

    pub fn to_prompt(&self) -> String {
        if self.description.is_empty() {
            self.title.clone()
        } else {
            format!("Title: {}\n\nDescription:\n{}", self.title, self.description)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub project_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Falls back to the project's default target branch.
    #[serde(default)]
    pub target_branch: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid attempt outcome: {}", s)),
        }
    }
}

/// Workspace preparation state of an attempt. `Failed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionState {
    Uninitialized,
    Preparing,
    Ready,
    Failed,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: ProvisionState) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Preparing)
                | (Self::Preparing, Self::Ready)
                | (Self::Preparing, Self::Failed)
                | (Self::Uninitialized, Self::Failed)
        )
    }
}

impl FromStr for ProvisionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(Self::Uninitialized),
            "preparing" => Ok(Self::Preparing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid provision state: {}", s)),
        }
    }
}

/// Audit classification persisted with every failed attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    WorkspaceConflict,
    QueueRace,
    MergeConflict,
    AgentExecutionFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceConflict => "workspace_conflict",
            Self::QueueRace => "queue_race",
            Self::MergeConflict => "merge_conflict",
            Self::AgentExecutionFailure => "agent_execution_failure",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace_conflict" => Ok(Self::WorkspaceConflict),
            "queue_race" => Ok(Self::QueueRace),
            "merge_conflict" => Ok(Self::MergeConflict),
            "agent_execution_failure" => Ok(Self::AgentExecutionFailure),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: i64,
    pub task_id: i64,
    pub project_id: i64,
    pub execution_mode: ExecutionMode,
    pub workspace_state: ProvisionState,
    pub task_branch: Option<String>,
    pub workspace_path: Option<String>,
    /// Tip of the target branch when the task branch was cut.
    pub base_commit: Option<String>,
    pub before_head_commit: Option<String>,
    pub after_head_commit: Option<String>,
    pub merge_commit: Option<String>,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl ExecutionAttempt {
    /// Whether the run moved the task branch. Falls back to `base_commit`
    /// when `before_head_commit` was never recorded.
    pub fn has_new_commits(&self) -> bool {
        let before = self.before_head_commit.as_ref().or(self.base_commit.as_ref());
        match (before, &self.after_head_commit) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        }
    }
}

/// Result of a compare-and-swap write against the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Conflict,
}
