//! Per-project ordering of sequential tasks.
//!
//! Every mutation reads the task's current version and writes back with a
//! compare-and-swap, all inside one locked store call. A lost race (stale
//! version or a position taken by another writer) is retried with fresh
//! state up to the configured budget, then surfaced as [`QueueError::Race`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::events::{QueueEvent, broadcast_event};
use crate::store::DbHandle;
use crate::store::models::{ExecutionMode, NewTask, Project, Task, TaskStatus, WriteOutcome};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first lost race.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: Duration::from_millis(25),
        }
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            retries: config.race_retries,
            backoff: Duration::from_millis(config.race_backoff_ms),
        }
    }
}

#[derive(Clone)]
pub struct QueueManager {
    db: DbHandle,
    retry: RetryPolicy,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    pub fn new(db: DbHandle, retry: RetryPolicy, events: broadcast::Sender<QueueEvent>) -> Self {
        Self { db, retry, events }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    async fn retry_on_race<T, F, Fut>(&self, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(QueueError::Race { task_id, operation }) if attempt < self.retry.retries => {
                    attempt += 1;
                    warn!(task_id, operation, attempt, "queue race detected, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Create a task. Sequential tasks land at the tail of the queue.
    pub async fn create_task(&self, new: NewTask) -> Result<Task, QueueError> {
        let mode = new.execution_mode;
        let task = self
            .db
            .call(move |db| {
                let project = db
                    .get_project(new.project_id)?
                    .ok_or(QueueError::ProjectNotFound { id: new.project_id })?;
                let target = new
                    .target_branch
                    .clone()
                    .unwrap_or(project.default_target_branch);
                Ok::<_, QueueError>(db.create_task(&new, &target)?)
            })
            .await?;
        info!(task_id = task.id, project_id = task.project_id, mode = mode.as_str(), "task created");
        match mode {
            ExecutionMode::Sequential => self.enqueue(task.id).await,
            ExecutionMode::Parallel => Ok(task),
        }
    }

    /// Make the task sequential at the tail of its project's queue.
    /// Already-queued tasks are returned unchanged.
    pub async fn enqueue(&self, task_id: i64) -> Result<Task, QueueError> {
        let (task, newly_queued) = self
            .retry_on_race(|| {
                self.db.call(move |db| {
                    let task = db
                        .get_task(task_id)?
                        .ok_or(QueueError::TaskNotFound { id: task_id })?;
                    if task.status.is_terminal() || task.status == TaskStatus::InProgress {
                        return Err(QueueError::InvalidState {
                            id: task_id,
                            status: task.status,
                            operation: "enqueue",
                        });
                    }
                    if task.execution_mode == ExecutionMode::Sequential
                        && task.queue_position.is_some()
                    {
                        return Ok((task, false));
                    }
                    let position = db.max_queue_position(task.project_id)?.map_or(1, |p| p + 1);
                    match db.assign_queue_position(task.id, task.version, position)? {
                        WriteOutcome::Applied => {
                            let task = db
                                .get_task(task_id)?
                                .ok_or(QueueError::TaskNotFound { id: task_id })?;
                            Ok((task, true))
                        }
                        WriteOutcome::Conflict => Err(QueueError::Race {
                            task_id,
                            operation: "enqueue",
                        }),
                    }
                })
            })
            .await?;

        if newly_queued && let Some(position) = task.queue_position {
            info!(task_id, project_id = task.project_id, position, "task enqueued");
            broadcast_event(
                &self.events,
                QueueEvent::TaskEnqueued {
                    project_id: task.project_id,
                    task_id,
                    queue_position: position,
                },
            );
        }
        Ok(task)
    }

    /// Make the task parallel and drop its position. Idempotent; the task
    /// branch is left alone.
    pub async fn dequeue(&self, task_id: i64) -> Result<Task, QueueError> {
        let (task, changed) = self
            .retry_on_race(|| {
                self.db.call(move |db| {
                    let task = db
                        .get_task(task_id)?
                        .ok_or(QueueError::TaskNotFound { id: task_id })?;
                    if task.execution_mode == ExecutionMode::Parallel
                        && task.queue_position.is_none()
                    {
                        return Ok((task, false));
                    }
                    if task.status == TaskStatus::InProgress {
                        return Err(QueueError::InvalidState {
                            id: task_id,
                            status: task.status,
                            operation: "dequeue",
                        });
                    }
                    match db.clear_queue_position(task.id, task.version)? {
                        WriteOutcome::Applied => {
                            let task = db
                                .get_task(task_id)?
                                .ok_or(QueueError::TaskNotFound { id: task_id })?;
                            Ok((task, true))
                        }
                        WriteOutcome::Conflict => Err(QueueError::Race {
                            task_id,
                            operation: "dequeue",
                        }),
                    }
                })
            })
            .await?;

        if changed {
            info!(task_id, project_id = task.project_id, "task dequeued");
            broadcast_event(
                &self.events,
                QueueEvent::TaskDequeued {
                    project_id: task.project_id,
                    task_id,
                },
            );
        }
        Ok(task)
    }

    pub async fn set_execution_mode(
        &self,
        task_id: i64,
        mode: ExecutionMode,
    ) -> Result<Task, QueueError> {
        match mode {
            ExecutionMode::Sequential => self.enqueue(task_id).await,
            ExecutionMode::Parallel => self.dequeue(task_id).await,
        }
    }

    /// Move a pending task to `new_index` (0-based, clamped) within the
    /// pending subset. The other pending tasks keep their relative order and
    /// the subset reuses its own set of positions, so running or in-review
    /// tasks keep theirs.
    pub async fn reorder(&self, task_id: i64, new_index: usize) -> Result<Vec<Task>, QueueError> {
        let queue = self
            .retry_on_race(|| {
                self.db.call(move |db| {
                    let task = db
                        .get_task(task_id)?
                        .ok_or(QueueError::TaskNotFound { id: task_id })?;
                    if task.execution_mode != ExecutionMode::Sequential {
                        return Err(QueueError::NotSequential { id: task_id });
                    }
                    if !task.is_pending() {
                        return Err(QueueError::NotPending { id: task_id });
                    }

                    let pending = db.list_pending(task.project_id)?;
                    let mut slots: Vec<i64> =
                        pending.iter().filter_map(|t| t.queue_position).collect();
                    slots.sort_unstable();

                    let mut order: Vec<&Task> = pending.iter().filter(|t| t.id != task_id).collect();
                    let index = new_index.min(order.len());
                    order.insert(index, &task);

                    let moves: Vec<(i64, i64, i64)> = order
                        .iter()
                        .zip(slots)
                        .filter(|(t, slot)| t.queue_position != Some(*slot))
                        .map(|(t, slot)| (t.id, t.version, slot))
                        .collect();
                    if moves.is_empty() {
                        return Ok(pending);
                    }
                    match db.reposition(&moves)? {
                        WriteOutcome::Applied => Ok(db.list_pending(task.project_id)?),
                        WriteOutcome::Conflict => Err(QueueError::Race {
                            task_id,
                            operation: "reorder",
                        }),
                    }
                })
            })
            .await?;

        if let Some(first) = queue.first() {
            info!(task_id, project_id = first.project_id, new_index, "queue reordered");
            broadcast_event(
                &self.events,
                QueueEvent::QueueReordered {
                    project_id: first.project_id,
                    task_ids: queue.iter().map(|t| t.id).collect(),
                },
            );
        }
        Ok(queue)
    }

    /// Pending sequential tasks in run order.
    pub async fn get_queue(&self, project_id: i64) -> Result<Vec<Task>, QueueError> {
        self.db
            .call(move |db| {
                db.get_project(project_id)?
                    .ok_or(QueueError::ProjectNotFound { id: project_id })?;
                Ok(db.list_pending(project_id)?)
            })
            .await
    }

    pub async fn get_next(&self, project_id: i64) -> Result<Option<Task>, QueueError> {
        Ok(self.get_queue(project_id).await?.into_iter().next())
    }

    /// Every task still holding a position (pending, running or awaiting
    /// review) in queue order.
    pub async fn get_queue_history(&self, project_id: i64) -> Result<Vec<Task>, QueueError> {
        self.db
            .call(move |db| {
                db.get_project(project_id)?
                    .ok_or(QueueError::ProjectNotFound { id: project_id })?;
                Ok(db.list_positioned(project_id)?)
            })
            .await
    }

    /// Clear a halted queue. Starting the next task is up to the caller.
    pub async fn resume(&self, project_id: i64) -> Result<Project, QueueError> {
        let project = self
            .db
            .call(move |db| {
                db.get_project(project_id)?
                    .ok_or(QueueError::ProjectNotFound { id: project_id })?;
                Ok::<_, QueueError>(db.set_queue_halted(project_id, None)?)
            })
            .await?;
        info!(project_id, "queue resumed");
        broadcast_event(&self.events, QueueEvent::QueueResumed { project_id });
        Ok(project)
    }

    /// Send a failed or cancelled sequential task back to the tail as todo.
    pub async fn requeue(&self, task_id: i64) -> Result<Task, QueueError> {
        self.retry_on_race(|| {
            self.db.call(move |db| {
                let task = db
                    .get_task(task_id)?
                    .ok_or(QueueError::TaskNotFound { id: task_id })?;
                if task.execution_mode != ExecutionMode::Sequential {
                    return Err(QueueError::NotSequential { id: task_id });
                }
                if !matches!(task.status, TaskStatus::InReview | TaskStatus::Cancelled) {
                    return Err(QueueError::InvalidState {
                        id: task_id,
                        status: task.status,
                        operation: "requeue",
                    });
                }
                match db.reset_for_requeue(task.id, task.version)? {
                    WriteOutcome::Applied => Ok(()),
                    WriteOutcome::Conflict => Err(QueueError::Race {
                        task_id,
                        operation: "requeue",
                    }),
                }
            })
        })
        .await?;
        self.enqueue(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::store::TaskDb;
    use crate::test_support::{add_project, add_task, memory_db};

    fn manager() -> (QueueManager, DbHandle) {
        let db = memory_db();
        let queue = QueueManager::new(db.clone(), RetryPolicy::default(), event_channel());
        (queue, db)
    }

    fn ids(tasks: &[Task]) -> Vec<i64> {
        tasks.iter().map(|t| t.id).collect()
    }

    fn positions(tasks: &[Task]) -> Vec<i64> {
        tasks.iter().filter_map(|t| t.queue_position).collect()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_tail_positions() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let a = add_task(&db, project.id, "A");
        let b = add_task(&db, project.id, "B");

        let a = queue.enqueue(a.id).await.unwrap();
        let b = queue.enqueue(b.id).await.unwrap();
        assert_eq!(a.queue_position, Some(1));
        assert_eq!(b.queue_position, Some(2));
        assert_eq!(a.execution_mode, ExecutionMode::Sequential);

        // Idempotent for an already queued task.
        let again = queue.enqueue(a.id).await.unwrap();
        assert_eq!(again.queue_position, Some(1));
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_enqueue_lands_at_tail() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let a = add_task(&db, project.id, "A");
        let b = add_task(&db, project.id, "B");

        queue.enqueue(a.id).await.unwrap();
        queue.enqueue(b.id).await.unwrap();
        let dequeued = queue.dequeue(a.id).await.unwrap();
        assert_eq!(dequeued.queue_position, None);
        assert_eq!(dequeued.execution_mode, ExecutionMode::Parallel);
        // Second dequeue is a no-op.
        queue.dequeue(a.id).await.unwrap();

        queue.enqueue(a.id).await.unwrap();
        let pending = queue.get_queue(project.id).await.unwrap();
        assert_eq!(ids(&pending), vec![b.id, a.id]);
        assert_eq!(positions(&pending), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_reorder_moves_task_to_front() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let a = add_task(&db, project.id, "A");
        let b = add_task(&db, project.id, "B");
        let c = add_task(&db, project.id, "C");
        for t in [&a, &b, &c] {
            queue.enqueue(t.id).await.unwrap();
        }

        let reordered = queue.reorder(c.id, 0).await.unwrap();
        assert_eq!(ids(&reordered), vec![c.id, a.id, b.id]);
        assert_eq!(positions(&reordered), vec![1, 2, 3]);
        assert_eq!(ids(&queue.get_queue(project.id).await.unwrap()), vec![c.id, a.id, b.id]);
    }

    #[tokio::test]
    async fn test_reorder_clamps_index_and_keeps_relative_order() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let a = add_task(&db, project.id, "A");
        let b = add_task(&db, project.id, "B");
        let c = add_task(&db, project.id, "C");
        for t in [&a, &b, &c] {
            queue.enqueue(t.id).await.unwrap();
        }

        let reordered = queue.reorder(a.id, 99).await.unwrap();
        assert_eq!(ids(&reordered), vec![b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn test_reorder_leaves_running_task_position_alone() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let a = add_task(&db, project.id, "A");
        let b = add_task(&db, project.id, "B");
        let c = add_task(&db, project.id, "C");
        for t in [&a, &b, &c] {
            queue.enqueue(t.id).await.unwrap();
        }
        db.lock_sync().unwrap().mark_in_progress(a.id).unwrap();

        let reordered = queue.reorder(c.id, 0).await.unwrap();
        assert_eq!(ids(&reordered), vec![c.id, b.id]);
        assert_eq!(positions(&reordered), vec![2, 3]);

        let running = db.lock_sync().unwrap().get_task(a.id).unwrap().unwrap();
        assert_eq!(running.queue_position, Some(1));
        let err = queue.reorder(a.id, 0).await.unwrap_err();
        assert!(matches!(err, QueueError::NotPending { .. }));
    }

    #[tokio::test]
    async fn test_get_queue_is_strictly_increasing_and_pending_only() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let mut tasks = Vec::new();
        for title in ["A", "B", "C", "D", "E"] {
            let t = add_task(&db, project.id, title);
            queue.enqueue(t.id).await.unwrap();
            tasks.push(t);
        }
        queue.reorder(tasks[4].id, 1).await.unwrap();
        queue.dequeue(tasks[2].id).await.unwrap();
        db.lock_sync()
            .unwrap()
            .set_task_status(tasks[0].id, TaskStatus::Done)
            .unwrap();

        let pending = queue.get_queue(project.id).await.unwrap();
        let pos = positions(&pending);
        assert_eq!(pos.len(), pending.len());
        assert!(pos.windows(2).all(|w| w[0] < w[1]), "positions {:?}", pos);
        assert!(pending.iter().all(|t| t.status == TaskStatus::Todo));
        assert_eq!(
            queue.get_next(project.id).await.unwrap().map(|t| t.id),
            Some(tasks[4].id)
        );
    }

    #[tokio::test]
    async fn test_create_sequential_task_enqueues_it() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let task = queue
            .create_task(NewTask {
                project_id: project.id,
                title: "Seq".into(),
                description: String::new(),
                execution_mode: ExecutionMode::Sequential,
                target_branch: None,
            })
            .await
            .unwrap();
        assert_eq!(task.queue_position, Some(1));
        assert_eq!(task.target_branch, "main");

        let err = queue
            .create_task(NewTask {
                project_id: 999,
                title: "Orphan".into(),
                description: String::new(),
                execution_mode: ExecutionMode::Parallel,
                target_branch: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ProjectNotFound { id: 999 }));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_finished_task() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let a = add_task(&db, project.id, "A");
        db.lock_sync()
            .unwrap()
            .set_task_status(a.id, TaskStatus::Done)
            .unwrap();
        let err = queue.enqueue(a.id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { operation: "enqueue", .. }));
    }

    #[tokio::test]
    async fn test_requeue_moves_failed_task_to_tail() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let a = add_task(&db, project.id, "A");
        let b = add_task(&db, project.id, "B");
        queue.enqueue(a.id).await.unwrap();
        queue.enqueue(b.id).await.unwrap();
        {
            let guard = db.lock_sync().unwrap();
            guard.mark_in_progress(a.id).unwrap();
            guard.set_task_status(a.id, TaskStatus::InReview).unwrap();
            guard.set_queue_halted(project.id, Some("A failed")).unwrap();
        }

        let requeued = queue.requeue(a.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Todo);
        assert_eq!(requeued.queue_position, Some(3));
        assert_eq!(ids(&queue.get_queue(project.id).await.unwrap()), vec![b.id, a.id]);

        let history = queue.get_queue_history(project.id).await.unwrap();
        assert_eq!(ids(&history), vec![b.id, a.id]);

        let project = queue.resume(project.id).await.unwrap();
        assert!(!project.queue_halted);
    }

    #[tokio::test]
    async fn test_race_is_retried_with_fresh_state() {
        let (queue, db) = manager();
        let project = add_project(&db, std::path::Path::new("/tmp/p"));
        let task_id = add_task(&db, project.id, "A").id;

        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = queue
            .retry_on_race(|| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let queue = queue.clone();
                async move {
                    if n == 0 {
                        Err(QueueError::Race {
                            task_id,
                            operation: "enqueue",
                        })
                    } else {
                        queue.enqueue(task_id).await
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result.queue_position, Some(1));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_enqueue_from_two_connections_keeps_positions_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunkline.db");
        let first = DbHandle::new(TaskDb::new(&path).unwrap());
        let second = DbHandle::new(TaskDb::new(&path).unwrap());
        let policy = RetryPolicy {
            retries: 20,
            backoff: Duration::from_millis(1),
        };
        let queues = [
            QueueManager::new(first.clone(), policy, event_channel()),
            QueueManager::new(second, policy, event_channel()),
        ];
        let project = add_project(&first, std::path::Path::new("/tmp/p"));
        let mut created: Vec<i64> = (0..10)
            .map(|i| add_task(&first, project.id, &format!("T{}", i)).id)
            .collect();

        let handles: Vec<_> = created
            .iter()
            .enumerate()
            .map(|(i, &task_id)| {
                let queue = queues[i % 2].clone();
                tokio::spawn(async move { queue.enqueue(task_id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let queued = queues[1].get_queue(project.id).await.unwrap();
        assert_eq!(queued.len(), 10);
        let positions = positions(&queued);
        assert_eq!(positions.len(), 10);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        let mut queued_ids = ids(&queued);
        queued_ids.sort();
        created.sort();
        assert_eq!(queued_ids, created);
    }

    #[tokio::test]
    async fn test_race_surfaces_after_budget() {
        let (queue, _db) = manager();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let err = queue
            .retry_on_race(|| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {
                    Err::<(), _>(QueueError::Race {
                        task_id: 1,
                        operation: "reorder",
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Race { operation: "reorder", .. }));
        // One try plus one retry.
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
