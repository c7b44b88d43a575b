use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::models::{AttemptOutcome, ErrorKind, ExecutionMode};

/// Capacity of the queue event channel. Slow subscribers lag rather than
/// block the orchestrator.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QueueEvent {
    TaskEnqueued {
        project_id: i64,
        task_id: i64,
        queue_position: i64,
    },
    TaskDequeued {
        project_id: i64,
        task_id: i64,
    },
    QueueReordered {
        project_id: i64,
        task_ids: Vec<i64>,
    },
    AttemptStarted {
        project_id: i64,
        task_id: i64,
        attempt_id: i64,
        execution_mode: ExecutionMode,
        task_branch: String,
    },
    AttemptFinished {
        project_id: i64,
        task_id: i64,
        attempt_id: i64,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        after_head_commit: Option<String>,
    },
    TaskMerged {
        project_id: i64,
        task_id: i64,
        target_branch: String,
        /// `None` for a fast-forward.
        merge_commit: Option<String>,
    },
    QueueAdvanced {
        project_id: i64,
        next_task_id: i64,
    },
    QueueIdle {
        project_id: i64,
    },
    QueueHalted {
        project_id: i64,
        task_id: i64,
        reason: String,
    },
    QueueResumed {
        project_id: i64,
    },
}

impl QueueEvent {
    pub fn project_id(&self) -> i64 {
        match self {
            Self::TaskEnqueued { project_id, .. }
            | Self::TaskDequeued { project_id, .. }
            | Self::QueueReordered { project_id, .. }
            | Self::AttemptStarted { project_id, .. }
            | Self::AttemptFinished { project_id, .. }
            | Self::TaskMerged { project_id, .. }
            | Self::QueueAdvanced { project_id, .. }
            | Self::QueueIdle { project_id }
            | Self::QueueHalted { project_id, .. }
            | Self::QueueResumed { project_id } => *project_id,
        }
    }
}

pub fn event_channel() -> broadcast::Sender<QueueEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Publish an event to every subscriber. No subscribers is not an error.
pub fn broadcast_event(tx: &broadcast::Sender<QueueEvent>, event: QueueEvent) {
    tracing::debug!(project_id = event.project_id(), ?event, "queue event");
    let _ = tx.send(event);
}
