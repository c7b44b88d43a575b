//! Event-driven facade over the queue, workspace, execution and merge layers.
//!
//! Every started attempt runs as its own tokio task. When it finishes, the
//! supervisor sends a [`TerminalNotice`] over an mpsc channel; a single
//! notice loop hands it to the [`QueueAdvancer`] and starts whatever task
//! the advancer elects. Nothing polls.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::advancer::{AdvanceDecision, QueueAdvancer};
use crate::config::TrunklineConfig;
use crate::errors::{OrchestratorError, QueueError};
use crate::events::{QueueEvent, broadcast_event, event_channel};
use crate::execution::{AgentRunner, ExecutionSupervisor, TerminalNotice};
use crate::git::{CommitIdentity, GitCapability, GitRepo};
use crate::merge::MergeCoordinator;
use crate::queue::{ProjectLease, ProjectLockTable, QueueManager, RetryPolicy};
use crate::store::DbHandle;
use crate::store::models::{
    AttemptOutcome, ErrorKind, ExecutionAttempt, ExecutionMode, NewTask, Project, Task,
    TaskStatus, WriteOutcome,
};
use crate::workspace::WorkspaceProvisioner;

/// Why a sequential task was not started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum QueuedReason {
    /// A failure stopped the queue; an operator must resume it.
    Halted { message: String },
    /// Another sequential attempt holds the project.
    Busy { holder: Option<i64> },
    /// Another task is ahead of this one.
    NotHead { head: Option<i64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { task_id: i64, attempt_id: i64 },
    Queued { task_id: Option<i64>, why: QueuedReason },
    /// Nothing pending for the project.
    Idle,
}

/// Result of claiming the queue head while holding the project lease.
enum Claim {
    Claimed(Box<Task>, ExecutionAttempt),
    Halted(String),
    NotHead(Option<i64>),
    Busy,
}

struct Inner {
    db: DbHandle,
    identity: CommitIdentity,
    queue: QueueManager,
    locks: ProjectLockTable,
    provisioner: Arc<WorkspaceProvisioner>,
    supervisor: ExecutionSupervisor,
    advancer: QueueAdvancer,
    running: Mutex<HashMap<i64, CancellationToken>>,
    events: broadcast::Sender<QueueEvent>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Wire up every component and start the notice loop. Must be called
    /// inside a tokio runtime.
    pub fn new(db: DbHandle, config: &TrunklineConfig, runner: Arc<dyn AgentRunner>) -> Self {
        let events = event_channel();
        let identity = config.commit_identity();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let locks = ProjectLockTable::new();
        let provisioner = Arc::new(WorkspaceProvisioner::from_config(db.clone(), config));
        let queue = QueueManager::new(
            db.clone(),
            RetryPolicy::from(&config.toml.queue),
            events.clone(),
        );
        let supervisor = ExecutionSupervisor::new(
            db.clone(),
            runner,
            identity.clone(),
            notice_tx,
            events.clone(),
        );
        let advancer = QueueAdvancer::new(
            db.clone(),
            MergeCoordinator::new(db.clone(), events.clone()),
            provisioner.clone(),
            locks.clone(),
            identity.clone(),
            events.clone(),
        );

        let inner = Arc::new(Inner {
            db,
            identity,
            queue,
            locks,
            provisioner,
            supervisor,
            advancer,
            running: Mutex::new(HashMap::new()),
            events,
        });
        tokio::spawn(notice_loop(Arc::downgrade(&inner), notice_rx));
        Self { inner }
    }

    pub fn db(&self) -> &DbHandle {
        &self.inner.db
    }

    pub fn queue(&self) -> &QueueManager {
        &self.inner.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<QueueEvent> {
        self.inner.events.clone()
    }

    // ── Projects and tasks ────────────────────────────────────────────

    pub async fn create_project(
        &self,
        name: &str,
        path: &Path,
        default_target_branch: Option<&str>,
    ) -> Result<Project, OrchestratorError> {
        register_project(&self.inner.db, name, path, default_target_branch).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, OrchestratorError> {
        Ok(self.inner.db.call(|db| db.list_projects()).await?)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task, OrchestratorError> {
        Ok(self
            .inner
            .db
            .call(move |db| db.get_task(task_id)?.ok_or(QueueError::TaskNotFound { id: task_id }))
            .await?)
    }

    pub async fn list_attempts(&self, task_id: i64) -> Result<Vec<ExecutionAttempt>, OrchestratorError> {
        Ok(self.inner.db.call(move |db| db.list_attempts(task_id)).await?)
    }

    /// Create a task; sequential tasks join the tail of the queue. Nothing
    /// is started.
    pub async fn create_task(&self, new: NewTask) -> Result<Task, OrchestratorError> {
        Ok(self.inner.queue.create_task(new).await?)
    }

    // ── Queue contract ────────────────────────────────────────────────

    pub async fn enqueue(&self, task_id: i64) -> Result<Task, OrchestratorError> {
        Ok(self.inner.queue.enqueue(task_id).await?)
    }

    pub async fn dequeue(&self, task_id: i64) -> Result<Task, OrchestratorError> {
        Ok(self.inner.queue.dequeue(task_id).await?)
    }

    pub async fn set_execution_mode(
        &self,
        task_id: i64,
        mode: ExecutionMode,
    ) -> Result<Task, OrchestratorError> {
        Ok(self.inner.queue.set_execution_mode(task_id, mode).await?)
    }

    pub async fn reorder(&self, task_id: i64, new_index: usize) -> Result<Vec<Task>, OrchestratorError> {
        Ok(self.inner.queue.reorder(task_id, new_index).await?)
    }

    pub async fn get_queue(&self, project_id: i64) -> Result<Vec<Task>, OrchestratorError> {
        Ok(self.inner.queue.get_queue(project_id).await?)
    }

    pub async fn get_next(&self, project_id: i64) -> Result<Option<Task>, OrchestratorError> {
        Ok(self.inner.queue.get_next(project_id).await?)
    }

    pub async fn get_queue_history(&self, project_id: i64) -> Result<Vec<Task>, OrchestratorError> {
        Ok(self.inner.queue.get_queue_history(project_id).await?)
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Start an attempt for `task_id`. Parallel tasks start right away;
    /// a sequential task starts only as the head of a running queue with the
    /// project lock free, otherwise it stays queued and the reason is
    /// reported.
    pub async fn start_task(&self, task_id: i64) -> Result<StartOutcome, OrchestratorError> {
        let task = self.get_task(task_id).await?;
        match task.execution_mode {
            ExecutionMode::Parallel => self.start_parallel(task).await,
            ExecutionMode::Sequential => self.start_sequential(task).await,
        }
    }

    /// Start the project's queue head if the queue is free to run.
    pub async fn kick(&self, project_id: i64) -> Result<StartOutcome, OrchestratorError> {
        match self.inner.advancer.advance(project_id).await? {
            AdvanceDecision::Elect { next_task_id, .. } => self.start_task(next_task_id).await,
            AdvanceDecision::Halted { reason, .. } => Ok(StartOutcome::Queued {
                task_id: None,
                why: QueuedReason::Halted { message: reason },
            }),
            AdvanceDecision::Busy { .. } => Ok(StartOutcome::Queued {
                task_id: None,
                why: QueuedReason::Busy {
                    holder: self.inner.locks.holder(project_id),
                },
            }),
            AdvanceDecision::Idle { .. } | AdvanceDecision::NotSequential => Ok(StartOutcome::Idle),
        }
    }

    /// Signal a running attempt to stop. Its work is committed and settled
    /// like any other outcome.
    pub fn cancel(&self, task_id: i64) -> Result<(), OrchestratorError> {
        let running = self
            .inner
            .running
            .lock()
            .map_err(|e| anyhow::anyhow!("running table poisoned: {}", e))?;
        match running.get(&task_id) {
            Some(token) => {
                info!(task_id, "cancelling attempt");
                token.cancel();
                Ok(())
            }
            None => Err(OrchestratorError::NotRunning { id: task_id }),
        }
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.inner
            .running
            .lock()
            .map(|running| running.contains_key(&task_id))
            .unwrap_or(false)
    }

    /// Clear a halt and start the queue head.
    pub async fn resume_queue(
        &self,
        project_id: i64,
    ) -> Result<(Project, StartOutcome), OrchestratorError> {
        let project = self.inner.queue.resume(project_id).await?;
        let started = self.kick(project_id).await?;
        Ok((project, started))
    }

    /// Put a failed or cancelled sequential task back at the tail, clear the
    /// halt and start the queue head.
    pub async fn requeue(&self, task_id: i64) -> Result<(Task, StartOutcome), OrchestratorError> {
        let task = self.inner.queue.requeue(task_id).await?;
        let (_, started) = self.resume_queue(task.project_id).await?;
        Ok((task, started))
    }

    /// Settle attempts left running by a previous process: capture their
    /// work, mark them failed and halt their queues. Returns how many were
    /// found.
    pub async fn recover_interrupted(&self) -> Result<usize, OrchestratorError> {
        let stale = self.inner.db.call(|db| db.list_running_attempts()).await?;
        for attempt in &stale {
            let attempt = attempt.clone();
            let project = self
                .inner
                .db
                .call({
                    let project_id = attempt.project_id;
                    move |db| db.get_project(project_id)?.context("Project not found")
                })
                .await?;

            let after = match &attempt.task_branch {
                Some(branch) => self.capture_interrupted(&attempt, &project, branch),
                None => None,
            };

            let reason = format!(
                "Task {} failed ({}): orchestrator restarted while the attempt was running",
                attempt.task_id,
                ErrorKind::AgentExecutionFailure
            );
            let stored = reason.clone();
            let sequential = attempt.execution_mode == ExecutionMode::Sequential;
            self.inner
                .db
                .call(move |db| {
                    db.complete_attempt(
                        attempt.id,
                        AttemptOutcome::Failed,
                        after.as_deref(),
                        Some(ErrorKind::AgentExecutionFailure),
                        Some("orchestrator restarted while the attempt was running"),
                    )?;
                    db.set_task_status(attempt.task_id, TaskStatus::InReview)?;
                    if sequential {
                        db.set_queue_halted(attempt.project_id, Some(&stored))?;
                    }
                    Ok::<_, anyhow::Error>(())
                })
                .await?;
            warn!(task_id = attempt.task_id, attempt_id = attempt.id, "recovered interrupted attempt");
            if sequential {
                broadcast_event(
                    &self.inner.events,
                    QueueEvent::QueueHalted {
                        project_id: attempt.project_id,
                        task_id: attempt.task_id,
                        reason,
                    },
                );
            }
        }
        Ok(stale.len())
    }

    /// Commit whatever an interrupted attempt left in its checkout. Returns
    /// the resulting HEAD, or `None` when the checkout is gone or has moved
    /// off the attempt's branch.
    fn capture_interrupted(
        &self,
        attempt: &ExecutionAttempt,
        project: &Project,
        branch: &str,
    ) -> Option<String> {
        let checkout = match (&attempt.execution_mode, &attempt.workspace_path) {
            (ExecutionMode::Parallel, Some(path)) => path.as_str(),
            _ => project.path.as_str(),
        };
        let repo = match GitRepo::open(Path::new(checkout), self.inner.identity.clone()) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(attempt_id = attempt.id, error = %e, "workspace of interrupted attempt is gone");
                return None;
            }
        };
        if repo.current_branch().ok().flatten().as_deref() != Some(branch) {
            warn!(attempt_id = attempt.id, branch, "checkout moved off the interrupted branch");
            return None;
        }
        if let Err(e) = repo.commit_if_dirty(&format!("trunkline: task {} interrupted", attempt.task_id)) {
            warn!(attempt_id = attempt.id, error = %e, "failed to capture interrupted work");
        }
        repo.current_head().ok()
    }

    async fn start_parallel(&self, task: Task) -> Result<StartOutcome, OrchestratorError> {
        if !matches!(task.status, TaskStatus::Todo | TaskStatus::InReview) {
            return Err(QueueError::InvalidState {
                id: task.id,
                status: task.status,
                operation: "start",
            }
            .into());
        }
        let task_id = task.id;
        let claimed = self
            .inner
            .db
            .call(move |db| match db.mark_in_progress(task_id)? {
                WriteOutcome::Applied => {
                    let attempt = db.create_attempt(task_id, ExecutionMode::Parallel)?;
                    let task = db.get_task(task_id)?.context("Task not found")?;
                    Ok::<_, anyhow::Error>(Some((task, attempt)))
                }
                WriteOutcome::Conflict => Ok(None),
            })
            .await?;
        let Some((task, attempt)) = claimed else {
            return Err(QueueError::Race {
                task_id,
                operation: "start",
            }
            .into());
        };
        self.launch(task, attempt, None).await
    }

    async fn start_sequential(&self, task: Task) -> Result<StartOutcome, OrchestratorError> {
        if !task.is_pending() {
            return Err(QueueError::NotPending { id: task.id }.into());
        }
        let project_id = task.project_id;
        let project = self
            .inner
            .db
            .call(move |db| {
                db.get_project(project_id)?
                    .ok_or(QueueError::ProjectNotFound { id: project_id })
            })
            .await?;
        if project.queue_halted {
            return Ok(StartOutcome::Queued {
                task_id: Some(task.id),
                why: QueuedReason::Halted {
                    message: project.halted_reason.unwrap_or_default(),
                },
            });
        }
        let head = self.inner.queue.get_next(project_id).await?.map(|t| t.id);
        if head != Some(task.id) {
            return Ok(StartOutcome::Queued {
                task_id: Some(task.id),
                why: QueuedReason::NotHead { head },
            });
        }

        let Some(lease) = self.inner.locks.try_acquire(project_id, task.id) else {
            debug!(task_id = task.id, project_id, "project lock held, task stays queued");
            return Ok(StartOutcome::Queued {
                task_id: Some(task.id),
                why: QueuedReason::Busy {
                    holder: self.inner.locks.holder(project_id),
                },
            });
        };

        // Re-check under the lease: a settling attempt may have halted the
        // queue or changed the head between the checks above and the acquire.
        let task_id = task.id;
        let claim = self
            .inner
            .db
            .call(move |db| -> Result<Claim, OrchestratorError> {
                let project = db
                    .get_project(project_id)?
                    .ok_or(QueueError::ProjectNotFound { id: project_id })?;
                if project.queue_halted {
                    return Ok(Claim::Halted(project.halted_reason.unwrap_or_default()));
                }
                let head = db.list_pending(project_id)?.into_iter().next().map(|t| t.id);
                if head != Some(task_id) {
                    return Ok(Claim::NotHead(head));
                }
                match db.mark_in_progress(task_id)? {
                    WriteOutcome::Applied => {
                        let attempt = db.create_attempt(task_id, ExecutionMode::Sequential)?;
                        let task = db.get_task(task_id)?.context("Task not found")?;
                        Ok(Claim::Claimed(Box::new(task), attempt))
                    }
                    // Another sequential task is in progress without holding
                    // the lock, e.g. one recovered after a restart.
                    WriteOutcome::Conflict => Ok(Claim::Busy),
                }
            })
            .await?;
        let why = match claim {
            Claim::Claimed(task, attempt) => return self.launch(*task, attempt, Some(lease)).await,
            Claim::Halted(message) => QueuedReason::Halted { message },
            Claim::NotHead(head) => QueuedReason::NotHead { head },
            Claim::Busy => QueuedReason::Busy { holder: None },
        };
        debug!(task_id, project_id, ?why, "task lost the claim under the lease");
        Ok(StartOutcome::Queued {
            task_id: Some(task_id),
            why,
        })
    }

    /// Provision the workspace and hand the attempt to the supervisor.
    async fn launch(
        &self,
        task: Task,
        attempt: ExecutionAttempt,
        lease: Option<ProjectLease>,
    ) -> Result<StartOutcome, OrchestratorError> {
        let inner = &self.inner;
        let project_id = task.project_id;
        let project = inner
            .db
            .call(move |db| db.get_project(project_id)?.context("Project not found"))
            .await?;

        let prepared = match GitRepo::open(Path::new(&project.path), inner.identity.clone()) {
            Ok(repo) => inner
                .provisioner
                .provision(&attempt, &task, &repo)
                .await
                .map_err(OrchestratorError::from),
            Err(e) => Err(OrchestratorError::Other(e)),
        };
        let workspace = match prepared {
            Ok(ws) => ws,
            Err(e) => {
                let kind = e.kind().unwrap_or(ErrorKind::WorkspaceConflict);
                inner
                    .supervisor
                    .report_provision_failure(&attempt, kind, e.to_string(), None, lease)
                    .await;
                return Err(e);
            }
        };

        let branch = workspace.task_branch.clone();
        let task_id = task.id;
        let cancel = CancellationToken::new();
        let registered = match inner
            .db
            .call(move |db| db.set_task_branch(task_id, &branch))
            .await
        {
            Ok(()) => inner
                .running
                .lock()
                .map(|mut running| {
                    running.insert(task_id, cancel.clone());
                })
                .map_err(|e| anyhow::anyhow!("running table poisoned: {}", e)),
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            // The attempt is claimed and its workspace exists; settle it as a
            // failed start so the lease and workspace go back.
            error!(task_id, attempt_id = attempt.id, error = %format!("{:#}", e), "failed to register attempt");
            inner
                .supervisor
                .report_provision_failure(
                    &attempt,
                    ErrorKind::WorkspaceConflict,
                    format!("{:#}", e),
                    Some(workspace),
                    lease,
                )
                .await;
            return Err(e.into());
        }

        info!(
            task_id = task.id,
            project_id,
            attempt_id = attempt.id,
            mode = task.execution_mode.as_str(),
            branch = %workspace.task_branch,
            "attempt started"
        );
        broadcast_event(
            &inner.events,
            QueueEvent::AttemptStarted {
                project_id,
                task_id: task.id,
                attempt_id: attempt.id,
                execution_mode: task.execution_mode,
                task_branch: workspace.task_branch.clone(),
            },
        );

        let outcome = StartOutcome::Started {
            task_id: task.id,
            attempt_id: attempt.id,
        };
        let supervisor = inner.supervisor.clone();
        tokio::spawn(async move {
            supervisor.supervise(task, attempt, workspace, lease, cancel).await;
        });
        Ok(outcome)
    }

    async fn handle_notice(&self, notice: TerminalNotice) {
        let (task_id, project_id) = (notice.task_id, notice.project_id);
        if let Ok(mut running) = self.inner.running.lock() {
            running.remove(&task_id);
        }
        match self.inner.advancer.on_task_terminal(notice).await {
            Ok(AdvanceDecision::Elect { next_task_id, .. }) => {
                match self.start_task(next_task_id).await {
                    Ok(outcome) => debug!(project_id, next_task_id, ?outcome, "elected task dispatched"),
                    Err(e) => warn!(project_id, next_task_id, error = %e, "failed to start elected task"),
                }
            }
            Ok(decision) => debug!(task_id, project_id, ?decision, "notice settled"),
            Err(e) => error!(task_id, project_id, error = %format!("{:#}", e), "failed to settle attempt"),
        }
    }
}

async fn notice_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<TerminalNotice>) {
    while let Some(notice) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Orchestrator { inner }.handle_notice(notice).await;
    }
    debug!("notice loop stopped");
}

/// Validate that `path` is a git checkout and store it as a project. The
/// default target branch falls back to the checkout's current branch.
pub async fn register_project(
    db: &DbHandle,
    name: &str,
    path: &Path,
    default_target_branch: Option<&str>,
) -> Result<Project, OrchestratorError> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Project path {} does not exist", path.display()))?;
    let repo = GitRepo::open(&path, CommitIdentity::default())?;
    let branch = match default_target_branch {
        Some(branch) => {
            if !repo.branch_exists(branch)? {
                return Err(anyhow::anyhow!("Branch '{}' does not exist in {}", branch, path.display()).into());
            }
            branch.to_string()
        }
        None => repo
            .current_branch()?
            .unwrap_or_else(|| "main".to_string()),
    };
    let name = name.to_string();
    let path = path.to_string_lossy().into_owned();
    let project = db
        .call(move |db| db.create_project(&name, &path, &branch))
        .await?;
    info!(project_id = project.id, name = %project.name, path = %project.path, "project registered");
    Ok(project)
}
