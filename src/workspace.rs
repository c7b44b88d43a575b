//! Prepares the working directory and branch for an attempt.
//!
//! Sequential tasks reuse the project's main checkout: the provisioner cuts a
//! fresh task branch from the target branch tip, checks it out in place, and
//! exposes the checkout through a symlink under the workspace root. Parallel
//! tasks get their own linked worktree on their own branch.
//!
//! Every attempt moves through `Uninitialized → Preparing → Ready | Failed`
//! and the state is persisted on the attempt row.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TrunklineConfig;
use crate::errors::WorkspaceError;
use crate::git::GitCapability;
use crate::store::DbHandle;
use crate::store::models::{ExecutionAttempt, ExecutionMode, Task};

pub use crate::store::models::ProvisionState;

/// Lowercase, dash-separated slug of `title`, at most `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.chars().count() > max_len {
        slug.chars()
            .take(max_len)
            .collect::<String>()
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreparedWorkspace {
    pub mode: ExecutionMode,
    /// Directory the agent runs in.
    pub working_dir: PathBuf,
    /// Main checkout of the project.
    pub repo_dir: PathBuf,
    pub task_branch: String,
    /// Target branch tip the task branch was cut from.
    pub base_commit: String,
    /// Set for parallel workspaces.
    pub worktree_name: Option<String>,
}

impl PreparedWorkspace {
    /// Checkout that git operations for this attempt should open: the
    /// worktree for parallel attempts, the main checkout otherwise.
    pub fn checkout_dir(&self) -> &Path {
        match self.worktree_name {
            Some(_) => &self.working_dir,
            None => &self.repo_dir,
        }
    }
}

pub struct WorkspaceProvisioner {
    db: DbHandle,
    workspace_root: PathBuf,
    branch_prefix: String,
    collision_budget: u32,
}

impl WorkspaceProvisioner {
    pub fn new(
        db: DbHandle,
        workspace_root: PathBuf,
        branch_prefix: impl Into<String>,
        collision_budget: u32,
    ) -> Self {
        Self {
            db,
            workspace_root,
            branch_prefix: branch_prefix.into(),
            collision_budget: collision_budget.max(1),
        }
    }

    pub fn from_config(db: DbHandle, config: &TrunklineConfig) -> Self {
        Self::new(
            db,
            config.workspace_root(),
            config.toml.workspace.branch_prefix.clone(),
            config.toml.workspace.collision_budget,
        )
    }

    /// Deterministic branch name for a task, before collision suffixes.
    pub fn branch_base(&self, task: &Task) -> String {
        let slug = slugify(&task.title, 40);
        if slug.is_empty() {
            format!("{}/task-{}", self.branch_prefix, task.id)
        } else {
            format!("{}/task-{}-{}", self.branch_prefix, task.id, slug)
        }
    }

    /// Drive `attempt` through provisioning for `task` against the project
    /// repository `repo`.
    pub async fn provision(
        &self,
        attempt: &ExecutionAttempt,
        task: &Task,
        repo: &dyn GitCapability,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        self.record(attempt.id, ProvisionState::Preparing, None).await?;

        let prepared = match task.execution_mode {
            ExecutionMode::Sequential => self.prepare_sequential(task, repo).await,
            ExecutionMode::Parallel => self.prepare_parallel(attempt, task, repo).await,
        };

        match prepared {
            Ok(ws) => {
                self.record(attempt.id, ProvisionState::Ready, Some(&ws)).await?;
                info!(
                    task_id = task.id,
                    attempt_id = attempt.id,
                    branch = %ws.task_branch,
                    working_dir = %ws.working_dir.display(),
                    "workspace ready"
                );
                Ok(ws)
            }
            Err(e) => {
                warn!(task_id = task.id, attempt_id = attempt.id, error = %e, "workspace preparation failed");
                self.record(attempt.id, ProvisionState::Failed, None).await?;
                Err(e)
            }
        }
    }

    async fn record(
        &self,
        attempt_id: i64,
        state: ProvisionState,
        ws: Option<&PreparedWorkspace>,
    ) -> Result<(), WorkspaceError> {
        let branch = ws.map(|w| w.task_branch.clone());
        let base = ws.map(|w| w.base_commit.clone());
        let path = ws.map(|w| w.working_dir.to_string_lossy().into_owned());
        self.db
            .call(move |db| {
                db.update_attempt_workspace(
                    attempt_id,
                    state,
                    branch.as_deref(),
                    base.as_deref(),
                    path.as_deref(),
                )
            })
            .await
            .map_err(WorkspaceError::Store)
    }

    async fn prepare_sequential(
        &self,
        task: &Task,
        repo: &dyn GitCapability,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        let repo_dir = repo.workdir().to_path_buf();
        // Never discard or stash someone else's changes.
        if repo.is_dirty().map_err(WorkspaceError::Git)? {
            return Err(WorkspaceError::DirtyTree { path: repo_dir });
        }

        let (task_branch, base_commit) = self.create_fresh_branch(task, repo)?;
        repo.checkout(&task_branch).map_err(WorkspaceError::Git)?;

        let link = self.workspace_root.join(format!("task-{}", task.id));
        replace_link(&repo_dir, &link).await?;

        Ok(PreparedWorkspace {
            mode: ExecutionMode::Sequential,
            working_dir: link,
            repo_dir,
            task_branch,
            base_commit,
            worktree_name: None,
        })
    }

    async fn prepare_parallel(
        &self,
        attempt: &ExecutionAttempt,
        task: &Task,
        repo: &dyn GitCapability,
    ) -> Result<PreparedWorkspace, WorkspaceError> {
        let (task_branch, base_commit) = self.create_fresh_branch(task, repo)?;
        let name = format!("task-{}-attempt-{}", task.id, attempt.id);
        let path = self.workspace_root.join(&name);
        repo.add_worktree(&name, &path, &task_branch)
            .map_err(WorkspaceError::Git)?;

        Ok(PreparedWorkspace {
            mode: ExecutionMode::Parallel,
            working_dir: path,
            repo_dir: repo.workdir().to_path_buf(),
            task_branch,
            base_commit,
            worktree_name: Some(name),
        })
    }

    /// Create the first free branch name among `base`, `base-2`, `base-3`...
    /// within the collision budget. Returns `(branch, base_commit)`.
    fn create_fresh_branch(
        &self,
        task: &Task,
        repo: &dyn GitCapability,
    ) -> Result<(String, String), WorkspaceError> {
        let base = self.branch_base(task);
        for n in 0..self.collision_budget {
            let name = if n == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, n + 1)
            };
            if repo.branch_exists(&name).map_err(WorkspaceError::Git)? {
                debug!(task_id = task.id, branch = %name, "branch name taken");
                continue;
            }
            match repo.create_branch(&name, &task.target_branch) {
                Ok(sha) => return Ok((name, sha)),
                // Lost a race for the name; re-validate and try the next one.
                Err(e) if repo.branch_exists(&name).unwrap_or(false) => {
                    debug!(task_id = task.id, branch = %name, error = %e, "branch created concurrently");
                }
                Err(e) => return Err(WorkspaceError::Git(e)),
            }
        }
        Err(WorkspaceError::BranchCollision {
            base,
            attempts: self.collision_budget,
        })
    }

    /// Remove the workspace link or worktree. Branches are kept.
    pub async fn release(
        &self,
        ws: &PreparedWorkspace,
        repo: &dyn GitCapability,
    ) -> anyhow::Result<()> {
        match &ws.worktree_name {
            Some(name) => repo.remove_worktree(name)?,
            None => match tokio::fs::remove_file(&ws.working_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        debug!(branch = %ws.task_branch, "workspace released");
        Ok(())
    }
}

async fn replace_link(target: &Path, link: &Path) -> Result<(), WorkspaceError> {
    let io_err = |source| WorkspaceError::Io {
        path: link.to_path_buf(),
        source,
    };
    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    if tokio::fs::symlink_metadata(link).await.is_ok() {
        tokio::fs::remove_file(link).await.map_err(io_err)?;
    }
    link_dir(target, link).await.map_err(io_err)
}

#[cfg(unix)]
async fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{CommitIdentity, GitRepo};
    use crate::test_support::{add_project, add_task, init_repo, memory_db};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        repo_dir: TempDir,
        ws_root: TempDir,
        db: DbHandle,
        git: GitRepo,
        task: Task,
    }

    fn fixture(title: &str, mode: ExecutionMode) -> Fixture {
        let repo_dir = tempdir().unwrap();
        let ws_root = tempdir().unwrap();
        init_repo(repo_dir.path());
        let db = memory_db();
        let project = add_project(&db, repo_dir.path());
        let mut task = add_task(&db, project.id, title);
        task.execution_mode = mode;
        let git = GitRepo::open(repo_dir.path(), CommitIdentity::default()).unwrap();
        Fixture {
            repo_dir,
            ws_root,
            db,
            git,
            task,
        }
    }

    impl Fixture {
        fn provisioner(&self, budget: u32) -> WorkspaceProvisioner {
            WorkspaceProvisioner::new(
                self.db.clone(),
                self.ws_root.path().to_path_buf(),
                "trunkline",
                budget,
            )
        }

        fn attempt(&self) -> ExecutionAttempt {
            self.db
                .lock_sync()
                .unwrap()
                .create_attempt(self.task.id, self.task.execution_mode)
                .unwrap()
        }

        fn stored(&self, attempt_id: i64) -> ExecutionAttempt {
            self.db
                .lock_sync()
                .unwrap()
                .get_attempt(attempt_id)
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn test_slugify_normal_title() {
        assert_eq!(slugify("Fix the API bug", 50), "fix-the-api-bug");
        assert_eq!(slugify("Fix @#$ bug!", 50), "fix-bug");
        assert_eq!(slugify("@#$%^&*()", 50), "");
    }

    #[test]
    fn test_slugify_truncation_has_no_trailing_dash() {
        let result = slugify("This is a very long title that should be truncated", 20);
        assert_eq!(result, "this-is-a-very-long");
    }

    #[tokio::test]
    async fn test_sequential_checks_out_fresh_branch_in_main_repo() {
        let fx = fixture("Add login page", ExecutionMode::Sequential);
        let base = fx.git.current_head().unwrap();
        let attempt = fx.attempt();

        let ws = fx.provisioner(5).provision(&attempt, &fx.task, &fx.git).await.unwrap();

        assert_eq!(ws.task_branch, format!("trunkline/task-{}-add-login-page", fx.task.id));
        assert_eq!(ws.base_commit, base);
        assert_eq!(fx.git.current_branch().unwrap().as_deref(), Some(ws.task_branch.as_str()));
        assert_eq!(
            std::fs::canonicalize(&ws.working_dir).unwrap(),
            std::fs::canonicalize(fx.repo_dir.path()).unwrap()
        );

        let stored = fx.stored(attempt.id);
        assert_eq!(stored.workspace_state, ProvisionState::Ready);
        assert_eq!(stored.task_branch.as_deref(), Some(ws.task_branch.as_str()));
        assert_eq!(stored.base_commit.as_deref(), Some(base.as_str()));
    }

    #[tokio::test]
    async fn test_dirty_tree_fails_fast_without_touching_repo() {
        let fx = fixture("Dirty", ExecutionMode::Sequential);
        std::fs::write(fx.repo_dir.path().join("scratch.txt"), "keep me").unwrap();
        let attempt = fx.attempt();

        let err = fx
            .provisioner(5)
            .provision(&attempt, &fx.task, &fx.git)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::DirtyTree { .. }));

        assert_eq!(fx.git.current_branch().unwrap().as_deref(), Some("main"));
        assert!(fx.repo_dir.path().join("scratch.txt").exists());
        assert!(!fx.git.branch_exists(&fx.provisioner(5).branch_base(&fx.task)).unwrap());
        assert_eq!(fx.stored(attempt.id).workspace_state, ProvisionState::Failed);
    }

    #[tokio::test]
    async fn test_branch_collision_gets_numeric_suffix() {
        let fx = fixture("Retry me", ExecutionMode::Sequential);
        let provisioner = fx.provisioner(5);
        let base = provisioner.branch_base(&fx.task);
        fx.git.create_branch(&base, "main").unwrap();

        let ws = provisioner
            .provision(&fx.attempt(), &fx.task, &fx.git)
            .await
            .unwrap();
        assert_eq!(ws.task_branch, format!("{}-2", base));
    }

    #[tokio::test]
    async fn test_collision_budget_exhaustion() {
        let fx = fixture("Crowded", ExecutionMode::Sequential);
        let provisioner = fx.provisioner(2);
        let base = provisioner.branch_base(&fx.task);
        fx.git.create_branch(&base, "main").unwrap();
        fx.git.create_branch(&format!("{}-2", base), "main").unwrap();
        let attempt = fx.attempt();

        let err = provisioner
            .provision(&attempt, &fx.task, &fx.git)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::BranchCollision { attempts: 2, .. }));
        assert_eq!(err.kind(), crate::store::models::ErrorKind::WorkspaceConflict);
        assert_eq!(fx.stored(attempt.id).workspace_state, ProvisionState::Failed);
    }

    #[tokio::test]
    async fn test_parallel_uses_isolated_worktree() {
        let fx = fixture("Side quest", ExecutionMode::Parallel);
        // A dirty main checkout does not block parallel work.
        std::fs::write(fx.repo_dir.path().join("local.txt"), "wip").unwrap();
        let provisioner = fx.provisioner(5);
        let attempt = fx.attempt();

        let ws = provisioner.provision(&attempt, &fx.task, &fx.git).await.unwrap();
        assert!(ws.worktree_name.is_some());
        assert!(ws.working_dir.join("README.md").exists());
        assert_eq!(fx.git.current_branch().unwrap().as_deref(), Some("main"));

        let wt = GitRepo::open(&ws.working_dir, CommitIdentity::default()).unwrap();
        assert_eq!(wt.current_branch().unwrap().as_deref(), Some(ws.task_branch.as_str()));

        provisioner.release(&ws, &fx.git).await.unwrap();
        assert!(!ws.working_dir.exists());
        assert!(fx.git.branch_exists(&ws.task_branch).unwrap());
    }

    #[tokio::test]
    async fn test_release_removes_sequential_link_only() {
        let fx = fixture("Linked", ExecutionMode::Sequential);
        let provisioner = fx.provisioner(5);
        let ws = provisioner
            .provision(&fx.attempt(), &fx.task, &fx.git)
            .await
            .unwrap();
        provisioner.release(&ws, &fx.git).await.unwrap();
        assert!(std::fs::symlink_metadata(&ws.working_dir).is_err());
        assert!(fx.repo_dir.path().join("README.md").exists());
        // Releasing twice is harmless.
        provisioner.release(&ws, &fx.git).await.unwrap();
    }
}
