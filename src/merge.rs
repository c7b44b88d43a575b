//! Folds a finished sequential task branch back into its target branch.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::events::{QueueEvent, broadcast_event};
use crate::git::{GitCapability, MergeResult, MergeStrategy};
use crate::store::DbHandle;
use crate::store::models::{ExecutionAttempt, Task};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Target had not moved since the branch point; its ref now points at
    /// the task branch tip.
    FastForwarded { head: String },
    Merged { merge_commit: String },
    /// The target already contains every task commit.
    NothingToMerge,
    /// Nothing was written; the task branch is left as it was.
    Conflict { paths: Vec<String> },
}

impl MergeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Clone)]
pub struct MergeCoordinator {
    db: DbHandle,
    events: broadcast::Sender<QueueEvent>,
}

impl MergeCoordinator {
    pub fn new(db: DbHandle, events: broadcast::Sender<QueueEvent>) -> Self {
        Self { db, events }
    }

    /// Merge `attempt`'s task branch into `task.target_branch` in `repo`, the
    /// project's main checkout.
    ///
    /// On success the checkout is moved back onto the target branch. On
    /// conflict HEAD stays on the task branch so an operator can resolve it.
    pub async fn merge_back(
        &self,
        repo: &dyn GitCapability,
        attempt: &ExecutionAttempt,
        task: &Task,
    ) -> Result<MergeOutcome> {
        let task_branch = attempt
            .task_branch
            .as_deref()
            .with_context(|| format!("Attempt {} has no task branch", attempt.id))?;
        let target = task.target_branch.as_str();
        let after = match &attempt.after_head_commit {
            Some(sha) => sha.clone(),
            None => repo.branch_tip(task_branch)?,
        };
        let tip = repo.branch_tip(target)?;

        if repo.is_ancestor(&after, &tip)? {
            repo.checkout(target)?;
            info!(task_id = task.id, attempt_id = attempt.id, target_branch = target, "nothing to merge");
            return Ok(MergeOutcome::NothingToMerge);
        }

        let advanced = match &attempt.base_commit {
            Some(base) => *base != tip,
            None => !repo.is_ancestor(&tip, &after)?,
        };
        let strategy = if advanced {
            MergeStrategy::MergeCommit
        } else {
            MergeStrategy::FastForward
        };

        let outcome = match repo.merge(task_branch, target, strategy)? {
            MergeResult::FastForwarded { head } => MergeOutcome::FastForwarded { head },
            MergeResult::Merged { commit } => MergeOutcome::Merged {
                merge_commit: commit,
            },
            MergeResult::Conflict { paths } => {
                warn!(
                    task_id = task.id,
                    attempt_id = attempt.id,
                    branch = task_branch,
                    target_branch = target,
                    ?paths,
                    "merge conflict"
                );
                return Ok(MergeOutcome::Conflict { paths });
            }
        };

        let merge_commit = match &outcome {
            MergeOutcome::Merged { merge_commit } => Some(merge_commit.clone()),
            _ => None,
        };
        let attempt_id = attempt.id;
        let recorded = merge_commit.clone();
        self.db
            .call(move |db| db.record_merge(attempt_id, recorded.as_deref()))
            .await?;

        repo.checkout(target)?;
        info!(
            task_id = task.id,
            attempt_id,
            branch = task_branch,
            target_branch = target,
            strategy = ?strategy,
            merge_commit = merge_commit.as_deref(),
            "task merged"
        );
        broadcast_event(
            &self.events,
            QueueEvent::TaskMerged {
                project_id: task.project_id,
                task_id: task.id,
                target_branch: target.to_string(),
                merge_commit,
            },
        );
        Ok(outcome)
    }
}
