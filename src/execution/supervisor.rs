//! Runs one attempt to a terminal outcome.
//!
//! The supervisor owns the attempt from `Ready` until the completion notice
//! is sent. Whatever happens to the agent (success, failure, cancellation, a
//! panic in the runner) the workspace is committed-if-dirty before the
//! outcome is recorded, and the project lease rides along inside the notice
//! so the advancer can release it after merging.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{QueueEvent, broadcast_event};
use crate::execution::agent::{AgentExit, AgentRunner};
use crate::git::{CommitIdentity, GitCapability, GitRepo};
use crate::queue::ProjectLease;
use crate::store::DbHandle;
use crate::store::models::{AttemptOutcome, ErrorKind, ExecutionAttempt, ExecutionMode, Task};
use crate::workspace::PreparedWorkspace;

/// Completion notification for one attempt, sent exactly once.
#[derive(Debug)]
pub struct TerminalNotice {
    pub task_id: i64,
    pub project_id: i64,
    pub attempt_id: i64,
    pub mode: ExecutionMode,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// `None` when provisioning never produced a workspace.
    pub workspace: Option<PreparedWorkspace>,
    /// Held for sequential attempts until the advancer is done with them.
    pub lease: Option<ProjectLease>,
}

impl TerminalNotice {
    pub fn is_sequential(&self) -> bool {
        self.mode == ExecutionMode::Sequential
    }
}

#[derive(Clone)]
pub struct ExecutionSupervisor {
    db: DbHandle,
    runner: Arc<dyn AgentRunner>,
    identity: CommitIdentity,
    notices: mpsc::UnboundedSender<TerminalNotice>,
    events: broadcast::Sender<QueueEvent>,
}

impl ExecutionSupervisor {
    pub fn new(
        db: DbHandle,
        runner: Arc<dyn AgentRunner>,
        identity: CommitIdentity,
        notices: mpsc::UnboundedSender<TerminalNotice>,
        events: broadcast::Sender<QueueEvent>,
    ) -> Self {
        Self {
            db,
            runner,
            identity,
            notices,
            events,
        }
    }

    /// Run `task` in `workspace` until it finishes or `cancel` fires, then
    /// notify the advancer.
    pub async fn supervise(
        &self,
        task: Task,
        attempt: ExecutionAttempt,
        workspace: PreparedWorkspace,
        lease: Option<ProjectLease>,
        cancel: CancellationToken,
    ) {
        let repo = match GitRepo::open(workspace.checkout_dir(), self.identity.clone()) {
            Ok(repo) => repo,
            Err(e) => {
                error!(task_id = task.id, attempt_id = attempt.id, error = %e, "workspace is not a git checkout");
                self.finish(
                    &attempt,
                    AttemptOutcome::Failed,
                    None,
                    Some(ErrorKind::WorkspaceConflict),
                    Some(format!("{:#}", e)),
                    Some(workspace),
                    lease,
                )
                .await;
                return;
            }
        };

        match repo.current_head() {
            Ok(before) => {
                let attempt_id = attempt.id;
                if let Err(e) = self
                    .db
                    .call(move |db| db.set_attempt_before_head(attempt_id, &before))
                    .await
                {
                    warn!(attempt_id, error = %e, "failed to record before_head_commit");
                }
            }
            Err(e) => warn!(attempt_id = attempt.id, error = %e, "failed to read HEAD before run"),
        }

        info!(
            task_id = task.id,
            attempt_id = attempt.id,
            branch = %workspace.task_branch,
            "attempt running"
        );

        // Run the agent on its own task so a panic becomes a crash outcome
        // instead of skipping commit-if-dirty.
        let runner = self.runner.clone();
        let run_task = task.clone();
        let working_dir = workspace.working_dir.clone();
        let run_cancel = cancel.clone();
        let joined = tokio::spawn(async move {
            runner.run(&run_task, &working_dir, run_cancel).await
        })
        .await;

        let (mut outcome, mut error_kind, mut error_message) = match joined {
            Ok(Ok(AgentExit::Completed)) => (AttemptOutcome::Succeeded, None, None),
            Ok(Ok(AgentExit::Cancelled)) => (AttemptOutcome::Cancelled, None, None),
            Ok(Ok(AgentExit::Failed { message })) => (
                AttemptOutcome::Failed,
                Some(ErrorKind::AgentExecutionFailure),
                Some(message),
            ),
            Ok(Err(e)) => (
                AttemptOutcome::Failed,
                Some(ErrorKind::AgentExecutionFailure),
                Some(format!("{:#}", e)),
            ),
            Err(join_err) => (
                AttemptOutcome::Failed,
                Some(ErrorKind::AgentExecutionFailure),
                Some(format!("agent runner crashed: {}", join_err)),
            ),
        };

        let message = format!("trunkline: task {} {}\n\n{}", task.id, outcome.as_str(), task.title);
        match repo.commit_if_dirty(&message) {
            Ok(Some(sha)) => info!(task_id = task.id, attempt_id = attempt.id, commit = %sha, "captured uncommitted work"),
            Ok(None) => {}
            Err(e) => {
                error!(task_id = task.id, attempt_id = attempt.id, error = %e, "commit-if-dirty failed");
                outcome = AttemptOutcome::Failed;
                error_kind = Some(ErrorKind::WorkspaceConflict);
                error_message = Some(format!("Failed to commit workspace changes: {:#}", e));
            }
        }

        let after = repo.current_head().ok();
        self.finish(
            &attempt,
            outcome,
            after,
            error_kind,
            error_message,
            Some(workspace),
            lease,
        )
        .await;
    }

    /// Record a failure to get the attempt running and notify the advancer.
    /// No agent ran, so there is nothing to commit. `workspace` is whatever
    /// provisioning had already prepared, handed on for release.
    pub async fn report_provision_failure(
        &self,
        attempt: &ExecutionAttempt,
        kind: ErrorKind,
        message: String,
        workspace: Option<PreparedWorkspace>,
        lease: Option<ProjectLease>,
    ) {
        self.finish(
            attempt,
            AttemptOutcome::Failed,
            None,
            Some(kind),
            Some(message),
            workspace,
            lease,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        attempt: &ExecutionAttempt,
        outcome: AttemptOutcome,
        after_head: Option<String>,
        error_kind: Option<ErrorKind>,
        error_message: Option<String>,
        workspace: Option<PreparedWorkspace>,
        lease: Option<ProjectLease>,
    ) {
        let attempt_id = attempt.id;
        let after = after_head.clone();
        let message = error_message.clone();
        if let Err(e) = self
            .db
            .call(move |db| {
                db.complete_attempt(attempt_id, outcome, after.as_deref(), error_kind, message.as_deref())
            })
            .await
        {
            error!(attempt_id, error = %e, "failed to record attempt outcome");
        }

        info!(
            task_id = attempt.task_id,
            attempt_id,
            outcome = outcome.as_str(),
            error_kind = error_kind.map(|k| k.as_str()),
            "attempt finished"
        );
        broadcast_event(
            &self.events,
            QueueEvent::AttemptFinished {
                project_id: attempt.project_id,
                task_id: attempt.task_id,
                attempt_id,
                outcome,
                error_kind,
                after_head_commit: after_head,
            },
        );

        let notice = TerminalNotice {
            task_id: attempt.task_id,
            project_id: attempt.project_id,
            attempt_id,
            mode: attempt.execution_mode,
            outcome,
            error_kind,
            error_message,
            workspace,
            lease,
        };
        if self.notices.send(notice).is_err() {
            // The lease inside the notice is dropped with it.
            error!(attempt_id, "completion channel closed; outcome not delivered");
        }
    }
}
