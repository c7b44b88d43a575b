use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::*;

/// Async-safe handle to the task database.
///
/// Wraps `TaskDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. The mutex also serializes every
/// read-modify-write issued from this process.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TaskDb>>,
}

impl DbHandle {
    pub fn new(db: TaskDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    ///
    /// The closure may return any error type that can absorb an
    /// `anyhow::Error`, so queue code can surface typed errors straight out
    /// of a single locked section.
    pub async fn call<F, R, E>(&self, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&TaskDb) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| E::from(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| E::from(anyhow::Error::new(e).context("DB task panicked")))?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TaskDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct TaskDb {
    conn: Connection,
}

const TASK_COLUMNS: &str = "id, project_id, title, description, status, execution_mode, \
     queue_position, target_branch, task_branch, version, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, task_id, project_id, execution_mode, workspace_state, \
     task_branch, workspace_path, base_commit, before_head_commit, after_head_commit, \
     merge_commit, outcome, error_kind, error_message, started_at, completed_at";

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl TaskDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    default_target_branch TEXT NOT NULL DEFAULT 'main',
                    queue_halted INTEGER NOT NULL DEFAULT 0,
                    halted_reason TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'todo',
                    execution_mode TEXT NOT NULL DEFAULT 'parallel',
                    queue_position INTEGER,
                    target_branch TEXT NOT NULL,
                    task_branch TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    execution_mode TEXT NOT NULL,
                    workspace_state TEXT NOT NULL DEFAULT 'uninitialized',
                    task_branch TEXT,
                    workspace_path TEXT,
                    base_commit TEXT,
                    before_head_commit TEXT,
                    after_head_commit TEXT,
                    merge_commit TEXT,
                    outcome TEXT NOT NULL DEFAULT 'running',
                    error_kind TEXT,
                    error_message TEXT,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_queue_position
                    ON tasks(project_id, queue_position)
                    WHERE queue_position IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        path: &str,
        default_target_branch: &str,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, path, default_target_branch) VALUES (?1, ?2, ?3)",
                params![name, path, default_target_branch],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, path, default_target_branch, queue_halted, halted_reason, created_at
                 FROM projects ORDER BY id",
            )
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], read_project)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, path, default_target_branch, queue_halted, halted_reason, created_at
                 FROM projects WHERE id = ?1",
            )
            .context("Failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], read_project)
            .context("Failed to query project")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read project row")?)),
            None => Ok(None),
        }
    }

    /// `Some(reason)` halts the project's queue, `None` resumes it.
    pub fn set_queue_halted(&self, project_id: i64, reason: Option<&str>) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET queue_halted = ?1, halted_reason = ?2 WHERE id = ?3",
                params![reason.is_some(), reason, project_id],
            )
            .context("Failed to update queue halt flag")?;
        self.get_project(project_id)?
            .context("Project not found after halt update")
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    /// Insert a task. Queue placement is the queue manager's job, so the row
    /// always starts without a position.
    pub fn create_task(&self, new: &NewTask, target_branch: &str) -> Result<Task> {
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, title, description, target_branch)
                 VALUES (?1, ?2, ?3, ?4)",
                params![new.project_id, new.title, new.description, target_branch],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let mut tasks = self.query_tasks(&sql, params![id])?;
        Ok(tasks.pop())
    }

    pub fn list_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 ORDER BY id");
        self.query_tasks(&sql, params![project_id])
    }

    /// Pending sequential tasks: todo, positioned, ordered by
    /// (queue_position, created_at, id).
    pub fn list_pending(&self, project_id: i64) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE project_id = ?1 AND execution_mode = 'sequential'
               AND status = 'todo' AND queue_position IS NOT NULL
             ORDER BY queue_position, created_at, id"
        );
        self.query_tasks(&sql, params![project_id])
    }

    /// Every task still holding a position, whatever its status.
    pub fn list_positioned(&self, project_id: i64) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE project_id = ?1 AND queue_position IS NOT NULL
             ORDER BY queue_position, created_at, id"
        );
        self.query_tasks(&sql, params![project_id])
    }

    pub fn max_queue_position(&self, project_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MAX(queue_position) FROM tasks WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to read max queue position")
    }

    pub fn count_active_sequential(&self, project_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE project_id = ?1 AND execution_mode = 'sequential' AND status = 'inprogress'",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count active sequential tasks")
    }

    /// Compare-and-swap: make the task sequential at `position` if nobody
    /// wrote it since `expected_version` and the slot is free.
    pub fn assign_queue_position(
        &self,
        task_id: i64,
        expected_version: i64,
        position: i64,
    ) -> Result<WriteOutcome> {
        let result = self.conn.execute(
            "UPDATE tasks SET execution_mode = 'sequential', queue_position = ?1,
                    version = version + 1, updated_at = datetime('now')
             WHERE id = ?2 AND version = ?3",
            params![position, task_id, expected_version],
        );
        match result {
            Ok(0) => Ok(WriteOutcome::Conflict),
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(e) if is_constraint_violation(&e) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e).context("Failed to assign queue position"),
        }
    }

    /// Compare-and-swap: switch the task to parallel and drop its position.
    pub fn clear_queue_position(&self, task_id: i64, expected_version: i64) -> Result<WriteOutcome> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET execution_mode = 'parallel', queue_position = NULL,
                        version = version + 1, updated_at = datetime('now')
                 WHERE id = ?1 AND version = ?2",
                params![task_id, expected_version],
            )
            .context("Failed to clear queue position")?;
        Ok(if changed == 0 {
            WriteOutcome::Conflict
        } else {
            WriteOutcome::Applied
        })
    }

    /// Atomically move a set of tasks to new positions. Each entry is
    /// `(task_id, expected_version, new_position)`; any stale version rolls
    /// the whole batch back.
    pub fn reposition(&self, moves: &[(i64, i64, i64)]) -> Result<WriteOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        // Park every moved row on a negative slot first so the unique index
        // never sees two rows on the same position mid-swap.
        for (task_id, version, position) in moves {
            let result = tx.execute(
                "UPDATE tasks SET queue_position = ?1 WHERE id = ?2 AND version = ?3",
                params![-position, task_id, version],
            );
            match result {
                Ok(0) => return Ok(WriteOutcome::Conflict),
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => return Ok(WriteOutcome::Conflict),
                Err(e) => return Err(e).context("Failed to park queue position"),
            }
        }
        for (task_id, _, position) in moves {
            let result = tx.execute(
                "UPDATE tasks SET queue_position = ?1, version = version + 1,
                        updated_at = datetime('now')
                 WHERE id = ?2",
                params![position, task_id],
            );
            match result {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => return Ok(WriteOutcome::Conflict),
                Err(e) => return Err(e).context("Failed to write queue position"),
            }
        }

        tx.commit().context("Failed to commit reposition")?;
        Ok(WriteOutcome::Applied)
    }

    /// Move a task to inprogress. For sequential tasks the update only
    /// applies when no other sequential task of the project is inprogress.
    pub fn mark_in_progress(&self, task_id: i64) -> Result<WriteOutcome> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'inprogress', version = version + 1,
                        updated_at = datetime('now')
                 WHERE id = ?1
                   AND status NOT IN ('inprogress', 'done', 'cancelled')
                   AND (execution_mode = 'parallel' OR NOT EXISTS (
                        SELECT 1 FROM tasks other
                        WHERE other.project_id = tasks.project_id
                          AND other.execution_mode = 'sequential'
                          AND other.status = 'inprogress'))",
                params![task_id],
            )
            .context("Failed to mark task in progress")?;
        Ok(if changed == 0 {
            WriteOutcome::Conflict
        } else {
            WriteOutcome::Applied
        })
    }

    /// Set a task's status. Reaching done or cancelled drops the position.
    pub fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<Task> {
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1,
                        queue_position = CASE WHEN ?1 IN ('done', 'cancelled')
                                              THEN NULL ELSE queue_position END,
                        version = version + 1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![status.as_str(), task_id],
            )
            .context("Failed to update task status")?;
        self.get_task(task_id)?
            .context("Task not found after status update")
    }

    /// Put a task back to todo without a position, ready to be enqueued.
    pub fn reset_for_requeue(&self, task_id: i64, expected_version: i64) -> Result<WriteOutcome> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'todo', queue_position = NULL, task_branch = NULL,
                        version = version + 1, updated_at = datetime('now')
                 WHERE id = ?1 AND version = ?2",
                params![task_id, expected_version],
            )
            .context("Failed to reset task for requeue")?;
        Ok(if changed == 0 {
            WriteOutcome::Conflict
        } else {
            WriteOutcome::Applied
        })
    }

    pub fn set_task_branch(&self, task_id: i64, branch: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET task_branch = ?1, version = version + 1,
                        updated_at = datetime('now')
                 WHERE id = ?2",
                params![branch, task_id],
            )
            .context("Failed to set task branch")?;
        Ok(())
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    status: row.get(4)?,
                    execution_mode: row.get(5)?,
                    queue_position: row.get(6)?,
                    target_branch: row.get(7)?,
                    task_branch: row.get(8)?,
                    version: row.get(9)?,
                    created_at: row.get(10)?,
                    updated_at: row.get(11)?,
                })
            })
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            let r = row.context("Failed to read task row")?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }

    // ── Attempts ──────────────────────────────────────────────────────

    pub fn create_attempt(&self, task_id: i64, mode: ExecutionMode) -> Result<ExecutionAttempt> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO attempts (task_id, project_id, execution_mode)
                 SELECT id, project_id, ?2 FROM tasks WHERE id = ?1",
                params![task_id, mode.as_str()],
            )
            .context("Failed to insert attempt")?;
        if inserted == 0 {
            anyhow::bail!("Task {} not found while creating attempt", task_id);
        }
        let id = self.conn.last_insert_rowid();
        self.get_attempt(id)?
            .context("Attempt not found after insert")
    }

    pub fn get_attempt(&self, id: i64) -> Result<Option<ExecutionAttempt>> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = ?1");
        let mut attempts = self.query_attempts(&sql, params![id])?;
        Ok(attempts.pop())
    }

    pub fn list_attempts(&self, task_id: i64) -> Result<Vec<ExecutionAttempt>> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE task_id = ?1 ORDER BY id");
        self.query_attempts(&sql, params![task_id])
    }

    /// Attempts never completed, e.g. because the process died mid-run.
    pub fn list_running_attempts(&self) -> Result<Vec<ExecutionAttempt>> {
        let sql =
            format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE outcome = 'running' ORDER BY id");
        self.query_attempts(&sql, [])
    }

    pub fn update_attempt_workspace(
        &self,
        id: i64,
        state: ProvisionState,
        task_branch: Option<&str>,
        base_commit: Option<&str>,
        workspace_path: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE attempts SET workspace_state = ?1,
                        task_branch = COALESCE(task_branch, ?2),
                        base_commit = COALESCE(?3, base_commit),
                        workspace_path = COALESCE(?4, workspace_path)
                 WHERE id = ?5",
                params![state.as_str(), task_branch, base_commit, workspace_path, id],
            )
            .context("Failed to update attempt workspace")?;
        Ok(())
    }

    pub fn set_attempt_before_head(&self, id: i64, sha: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE attempts SET before_head_commit = ?1 WHERE id = ?2",
                params![sha, id],
            )
            .context("Failed to record before_head_commit")?;
        Ok(())
    }

    pub fn complete_attempt(
        &self,
        id: i64,
        outcome: AttemptOutcome,
        after_head_commit: Option<&str>,
        error_kind: Option<ErrorKind>,
        error_message: Option<&str>,
    ) -> Result<ExecutionAttempt> {
        self.conn
            .execute(
                "UPDATE attempts SET outcome = ?1,
                        after_head_commit = COALESCE(?2, after_head_commit),
                        error_kind = ?3, error_message = ?4,
                        completed_at = datetime('now')
                 WHERE id = ?5",
                params![
                    outcome.as_str(),
                    after_head_commit,
                    error_kind.map(|k| k.as_str()),
                    error_message,
                    id
                ],
            )
            .context("Failed to complete attempt")?;
        self.get_attempt(id)?
            .context("Attempt not found after completion")
    }

    pub fn record_merge(&self, id: i64, merge_commit: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE attempts SET merge_commit = ?1 WHERE id = ?2",
                params![merge_commit, id],
            )
            .context("Failed to record merge commit")?;
        Ok(())
    }

    fn query_attempts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ExecutionAttempt>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare attempt query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(AttemptRow {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    project_id: row.get(2)?,
                    execution_mode: row.get(3)?,
                    workspace_state: row.get(4)?,
                    task_branch: row.get(5)?,
                    workspace_path: row.get(6)?,
                    base_commit: row.get(7)?,
                    before_head_commit: row.get(8)?,
                    after_head_commit: row.get(9)?,
                    merge_commit: row.get(10)?,
                    outcome: row.get(11)?,
                    error_kind: row.get(12)?,
                    error_message: row.get(13)?,
                    started_at: row.get(14)?,
                    completed_at: row.get(15)?,
                })
            })
            .context("Failed to query attempts")?;
        let mut attempts = Vec::new();
        for row in rows {
            let r = row.context("Failed to read attempt row")?;
            attempts.push(r.into_attempt()?);
        }
        Ok(attempts)
    }
}

fn read_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        default_target_branch: row.get(3)?,
        queue_halted: row.get(4)?,
        halted_reason: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Intermediate row struct for reading tasks before parsing the enum columns.
struct TaskRow {
    id: i64,
    project_id: i64,
    title: String,
    description: String,
    status: String,
    execution_mode: String,
    queue_position: Option<i64>,
    target_branch: String,
    task_branch: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let execution_mode = ExecutionMode::from_str(&self.execution_mode)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse execution mode")?;

        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            status,
            execution_mode,
            queue_position: self.queue_position,
            target_branch: self.target_branch,
            task_branch: self.task_branch,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct AttemptRow {
    id: i64,
    task_id: i64,
    project_id: i64,
    execution_mode: String,
    workspace_state: String,
    task_branch: Option<String>,
    workspace_path: Option<String>,
    base_commit: Option<String>,
    before_head_commit: Option<String>,
    after_head_commit: Option<String>,
    merge_commit: Option<String>,
    outcome: String,
    error_kind: Option<String>,
    error_message: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl AttemptRow {
    fn into_attempt(self) -> Result<ExecutionAttempt> {
        let execution_mode = ExecutionMode::from_str(&self.execution_mode)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse attempt execution mode")?;
        let workspace_state = ProvisionState::from_str(&self.workspace_state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse workspace state")?;
        let outcome = AttemptOutcome::from_str(&self.outcome)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse attempt outcome")?;
        let error_kind = self
            .error_kind
            .as_deref()
            .map(ErrorKind::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse error kind")?;

        Ok(ExecutionAttempt {
            id: self.id,
            task_id: self.task_id,
            project_id: self.project_id,
            execution_mode,
            workspace_state,
            task_branch: self.task_branch,
            workspace_path: self.workspace_path,
            base_commit: self.base_commit,
            before_head_commit: self.before_head_commit,
            after_head_commit: self.after_head_commit,
            merge_commit: self.merge_commit,
            outcome,
            error_kind,
            error_message: self.error_message,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
