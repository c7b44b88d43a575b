//! Reacts to terminal attempt notices and decides what a project's queue
//! does next.
//!
//! Sequential outcomes are settled in a fixed order: merge (if there is work
//! to fold back), task status together with any queue halt, workspace
//! release, lease release. Only then is the queue asked for its next task.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::events::{QueueEvent, broadcast_event};
use crate::execution::TerminalNotice;
use crate::git::{CommitIdentity, GitCapability, GitRepo};
use crate::merge::{MergeCoordinator, MergeOutcome};
use crate::queue::ProjectLockTable;
use crate::store::DbHandle;
use crate::store::models::{AttemptOutcome, ErrorKind, ExecutionAttempt, ExecutionMode, TaskStatus};
use crate::workspace::{PreparedWorkspace, WorkspaceProvisioner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceDecision {
    /// Start this task next.
    Elect { project_id: i64, next_task_id: i64 },
    /// Nothing pending.
    Idle { project_id: i64 },
    /// The queue is stopped until an operator resumes it.
    Halted { project_id: i64, reason: String },
    /// Another sequential attempt still owns the project.
    Busy { project_id: i64 },
    /// The finished attempt was parallel; the queue is unaffected.
    NotSequential,
}

pub struct QueueAdvancer {
    db: DbHandle,
    merge: MergeCoordinator,
    provisioner: Arc<WorkspaceProvisioner>,
    locks: ProjectLockTable,
    identity: CommitIdentity,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueAdvancer {
    pub fn new(
        db: DbHandle,
        merge: MergeCoordinator,
        provisioner: Arc<WorkspaceProvisioner>,
        locks: ProjectLockTable,
        identity: CommitIdentity,
        events: broadcast::Sender<QueueEvent>,
    ) -> Self {
        Self {
            db,
            merge,
            provisioner,
            locks,
            identity,
            events,
        }
    }

    /// Settle one terminal attempt.
    ///
    /// If settling fails part way, the task is parked in review and its
    /// queue halted before the lease is dropped, so the project never stays
    /// claimed by a task nobody is running.
    pub async fn on_task_terminal(&self, mut notice: TerminalNotice) -> Result<AdvanceDecision> {
        let lease = notice.lease.take();
        let (task_id, project_id, sequential) =
            (notice.task_id, notice.project_id, notice.is_sequential());

        let settled = match self.settle(notice).await {
            Ok(settled) => settled,
            Err(e) => {
                self.quarantine(task_id, project_id, sequential, &e).await;
                drop(lease);
                return Err(e);
            }
        };
        if let Some(lease) = lease {
            lease.release();
        }

        match settled {
            Settled::Parallel => Ok(AdvanceDecision::NotSequential),
            Settled::Halted(reason) => Ok(AdvanceDecision::Halted { project_id, reason }),
            Settled::Clean => self.advance(project_id).await,
        }
    }

    /// Everything up to the lease release: merge, then task status and any
    /// halt in one write, then the workspace.
    async fn settle(&self, notice: TerminalNotice) -> Result<Settled> {
        let TerminalNotice {
            task_id,
            project_id,
            attempt_id,
            mode,
            outcome,
            error_kind,
            error_message,
            workspace,
            lease: _,
        } = notice;

        let (task, project, attempt) = self
            .db
            .call(move |db| {
                let task = db
                    .get_task(task_id)?
                    .with_context(|| format!("Task {} not found", task_id))?;
                let project = db
                    .get_project(project_id)?
                    .with_context(|| format!("Project {} not found", project_id))?;
                let attempt = db
                    .get_attempt(attempt_id)?
                    .with_context(|| format!("Attempt {} not found", attempt_id))?;
                Ok::<_, anyhow::Error>((task, project, attempt))
            })
            .await?;
        let repo = GitRepo::open(Path::new(&project.path), self.identity.clone())?;

        if mode != ExecutionMode::Sequential {
            let status = match outcome {
                AttemptOutcome::Cancelled => TaskStatus::Cancelled,
                _ => TaskStatus::InReview,
            };
            self.db
                .call(move |db| db.set_task_status(task_id, status))
                .await?;
            self.release_workspace(workspace.as_ref(), &repo).await;
            info!(task_id, attempt_id, status = status.as_str(), "parallel attempt settled");
            return Ok(Settled::Parallel);
        }

        let mut failure = match outcome {
            AttemptOutcome::Failed => Some((
                error_kind.unwrap_or(ErrorKind::AgentExecutionFailure),
                error_message.unwrap_or_else(|| "attempt failed".to_string()),
            )),
            _ => None,
        };

        let wants_merge = outcome == AttemptOutcome::Succeeded
            || (outcome == AttemptOutcome::Cancelled && moved_past_base(&attempt, workspace.as_ref()));
        if wants_merge && attempt.task_branch.is_some() {
            let merged = match self.merge.merge_back(&repo, &attempt, &task).await {
                Ok(MergeOutcome::Conflict { paths }) => Err((
                    ErrorKind::MergeConflict,
                    format!("Merge conflict in: {}", paths.join(", ")),
                )),
                Ok(_) => Ok(()),
                Err(e) => Err((
                    ErrorKind::WorkspaceConflict,
                    format!("Merge into '{}' failed: {:#}", task.target_branch, e),
                )),
            };
            if let Err((kind, message)) = merged {
                let stored = message.clone();
                self.db
                    .call(move |db| {
                        db.complete_attempt(attempt_id, AttemptOutcome::Failed, None, Some(kind), Some(&stored))
                    })
                    .await?;
                broadcast_event(
                    &self.events,
                    QueueEvent::AttemptFinished {
                        project_id,
                        task_id,
                        attempt_id,
                        outcome: AttemptOutcome::Failed,
                        error_kind: Some(kind),
                        after_head_commit: attempt.after_head_commit.clone(),
                    },
                );
                failure = Some((kind, message));
            }
        } else if outcome == AttemptOutcome::Cancelled
            && let Err(e) = repo.checkout(&task.target_branch)
        {
            warn!(task_id, error = %e, "failed to restore target branch after cancel");
        }

        let status = match (&failure, outcome) {
            (Some(_), _) => TaskStatus::InReview,
            (None, AttemptOutcome::Cancelled) => TaskStatus::Cancelled,
            (None, _) => TaskStatus::Done,
        };
        let halt = failure
            .as_ref()
            .map(|(kind, message)| format!("Task {} failed ({}): {}", task_id, kind, message));
        let stored = halt.clone();
        // The halt must be visible before the lease is released, or a
        // concurrent start could claim the project in between.
        self.db
            .call(move |db| {
                db.set_task_status(task_id, status)?;
                if let Some(reason) = &stored {
                    db.set_queue_halted(project_id, Some(reason))?;
                }
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        self.release_workspace(workspace.as_ref(), &repo).await;
        info!(task_id, project_id, attempt_id, status = status.as_str(), "sequential attempt settled");

        let Some(reason) = halt else {
            return Ok(Settled::Clean);
        };
        warn!(project_id, task_id, reason = %reason, "queue halted");
        broadcast_event(
            &self.events,
            QueueEvent::QueueHalted {
                project_id,
                task_id,
                reason: reason.clone(),
            },
        );
        Ok(Settled::Halted(reason))
    }

    /// Best effort after a settle error: park the task in review and halt a
    /// sequential queue so an operator looks at it.
    async fn quarantine(&self, task_id: i64, project_id: i64, sequential: bool, err: &anyhow::Error) {
        let reason = format!("Task {} could not be settled: {:#}", task_id, err);
        let stored = reason.clone();
        let written = self
            .db
            .call(move |db| {
                let halted = if sequential {
                    db.set_queue_halted(project_id, Some(&stored)).map(|_| ())
                } else {
                    Ok(())
                };
                let parked = db.set_task_status(task_id, TaskStatus::InReview).map(|_| ());
                halted.and(parked)
            })
            .await;
        if let Err(e) = written {
            error!(task_id, project_id, error = %format!("{:#}", e), "failed to quarantine unsettled task");
            return;
        }
        if sequential {
            warn!(project_id, task_id, "queue halted after settle error");
            broadcast_event(
                &self.events,
                QueueEvent::QueueHalted {
                    project_id,
                    task_id,
                    reason,
                },
            );
        }
    }

    /// Re-check that nothing sequential is running for the project and pick
    /// the queue head.
    pub async fn advance(&self, project_id: i64) -> Result<AdvanceDecision> {
        if self.locks.is_held(project_id) {
            return Ok(AdvanceDecision::Busy { project_id });
        }
        let (project, active, next) = self
            .db
            .call(move |db| {
                let project = db
                    .get_project(project_id)?
                    .with_context(|| format!("Project {} not found", project_id))?;
                let active = db.count_active_sequential(project_id)?;
                let next = db.list_pending(project_id)?.into_iter().next();
                Ok::<_, anyhow::Error>((project, active, next))
            })
            .await?;

        if project.queue_halted {
            return Ok(AdvanceDecision::Halted {
                project_id,
                reason: project.halted_reason.unwrap_or_default(),
            });
        }
        if active > 0 {
            return Ok(AdvanceDecision::Busy { project_id });
        }
        match next {
            Some(task) => {
                info!(project_id, next_task_id = task.id, "queue advanced");
                broadcast_event(
                    &self.events,
                    QueueEvent::QueueAdvanced {
                        project_id,
                        next_task_id: task.id,
                    },
                );
                Ok(AdvanceDecision::Elect {
                    project_id,
                    next_task_id: task.id,
                })
            }
            None => {
                info!(project_id, "queue idle");
                broadcast_event(&self.events, QueueEvent::QueueIdle { project_id });
                Ok(AdvanceDecision::Idle { project_id })
            }
        }
    }

    async fn release_workspace(&self, workspace: Option<&PreparedWorkspace>, repo: &dyn GitCapability) {
        if let Some(ws) = workspace
            && let Err(e) = self.provisioner.release(ws, repo).await
        {
            warn!(branch = %ws.task_branch, error = %e, "failed to release workspace");
        }
    }
}

/// How a terminal attempt settled, before the lease is let go.
enum Settled {
    Parallel,
    Halted(String),
    Clean,
}

/// A cancelled run has work worth merging when its branch moved. Without a
/// recorded start point, the base the workspace was cut from stands in.
fn moved_past_base(attempt: &ExecutionAttempt, workspace: Option<&PreparedWorkspace>) -> bool {
    if attempt.has_new_commits() {
        return true;
    }
    match (&attempt.before_head_commit, workspace, &attempt.after_head_commit) {
        (None, Some(ws), Some(after)) => *after != ws.base_commit,
        _ => false,
    }
}
