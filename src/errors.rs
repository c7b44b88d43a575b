//! Typed error hierarchy for trunkline.
//!
//! Three enums cover the three layers:
//! - `QueueError`: queue ordering and task store conflicts
//! - `WorkspaceError`: workspace provisioning against the shared repository
//! - `OrchestratorError`: starting, cancelling and resuming attempts
//!
//! The audit classification persisted with failed attempts lives in
//! [`crate::store::models::ErrorKind`]; `kind()` maps errors onto it.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::models::{ErrorKind, TaskStatus};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A concurrent writer changed the queue between read and write, and the
    /// bounded retry budget ran out.
    #[error("Queue race on task {task_id} during {operation}")]
    Race {
        task_id: i64,
        operation: &'static str,
    },

    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Task {id} is not a sequential task")]
    NotSequential { id: i64 },

    #[error("Task {id} is not pending in the queue")]
    NotPending { id: i64 },

    #[error("Task {id} is {status:?}, cannot {operation}")]
    InvalidState {
        id: i64,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl QueueError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Race { .. } => Some(ErrorKind::QueueRace),
            _ => None,
        }
    }
}

/// Errors from preparing a task's workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Repository at {path} has uncommitted changes")]
    DirtyTree { path: PathBuf },

    #[error("No free branch name for '{base}' after {attempts} attempts")]
    BranchCollision { base: String, attempts: u32 },

    #[error("Git error: {0}")]
    Git(#[source] anyhow::Error),

    #[error("Failed to prepare workspace at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to record workspace state: {0}")]
    Store(#[source] anyhow::Error),
}

impl WorkspaceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::WorkspaceConflict
    }
}

/// Errors surfaced by the orchestrator facade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("Task {id} has no running attempt")]
    NotRunning { id: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Queue(e) => e.kind(),
            Self::Workspace(e) => Some(e.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_race_carries_operation_and_kind() {
        let err = QueueError::Race {
            task_id: 7,
            operation: "enqueue",
        };
        match &err {
            QueueError::Race { task_id, operation } => {
                assert_eq!(*task_id, 7);
                assert_eq!(*operation, "enqueue");
            }
            _ => panic!("Expected Race variant"),
        }
        assert_eq!(err.kind(), Some(ErrorKind::QueueRace));
        assert!(err.to_string().contains("enqueue"));
    }

    #[test]
    fn queue_error_converts_from_anyhow() {
        let err: QueueError = anyhow::anyhow!("disk full").into();
        match &err {
            QueueError::Database(e) => assert!(e.to_string().contains("disk full")),
            _ => panic!("Expected Database variant"),
        }
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn invalid_state_mentions_status() {
        let err = QueueError::InvalidState {
            id: 3,
            status: TaskStatus::Done,
            operation: "enqueue",
        };
        let msg = err.to_string();
        assert!(msg.contains("Done"));
        assert!(msg.contains("enqueue"));
    }

    #[test]
    fn workspace_errors_classify_as_workspace_conflict() {
        let dirty = WorkspaceError::DirtyTree {
            path: PathBuf::from("/repo"),
        };
        let collision = WorkspaceError::BranchCollision {
            base: "trunkline/task-1".into(),
            attempts: 5,
        };
        assert_eq!(dirty.kind(), ErrorKind::WorkspaceConflict);
        assert_eq!(collision.kind(), ErrorKind::WorkspaceConflict);
        assert!(collision.to_string().contains("5 attempts"));
    }

    #[test]
    fn orchestrator_error_wraps_queue_error() {
        let inner = QueueError::NotPending { id: 4 };
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::Queue(QueueError::NotPending { id }) => assert_eq!(*id, 4),
            _ => panic!("Expected Queue(NotPending)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<QueueError>();
        assert_error::<WorkspaceError>();
        assert_error::<OrchestratorError>();
    }
}
