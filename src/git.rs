//! Git primitives used by the orchestrator, backed by `git2`.
//!
//! `GitCapability` is the seam the provisioner, supervisor and merge
//! coordinator talk to. `GitRepo` is the real implementation: it reopens the
//! repository on every call so one value can be shared across tasks without
//! holding a `git2::Repository` (which is not `Sync`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, IndexAddOption, IndexMatchedPath, Repository, Signature, Status, StatusOptions,
    WorktreeAddOptions, WorktreePruneOptions,
};
use serde::{Deserialize, Serialize};

/// Directory reserved for trunkline state inside a project checkout. Never
/// counted as a change and never committed.
pub const STATE_DIR: &str = ".trunkline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Move the target ref forward; fails if the histories diverged.
    FastForward,
    /// Always write a two-parent merge commit.
    MergeCommit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    FastForwarded { head: String },
    Merged { commit: String },
    Conflict { paths: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "trunkline".to_string(),
            email: "trunkline@localhost".to_string(),
        }
    }
}

pub trait GitCapability: Send + Sync {
    /// Working directory this capability operates on.
    fn workdir(&self) -> &Path;

    /// Create `name` pointing at `from_ref`'s commit. Returns the commit SHA.
    fn create_branch(&self, name: &str, from_ref: &str) -> Result<String>;

    fn branch_exists(&self, name: &str) -> Result<bool>;

    fn branch_tip(&self, name: &str) -> Result<String>;

    /// Switch the working tree to a local branch. Refuses to clobber local
    /// modifications.
    fn checkout(&self, branch: &str) -> Result<()>;

    fn current_head(&self) -> Result<String>;

    /// Short name of the checked-out branch, `None` when detached.
    fn current_branch(&self) -> Result<Option<String>>;

    /// Tracked modifications or untracked files outside the state directory.
    fn is_dirty(&self) -> Result<bool>;

    /// Stage everything and commit on HEAD. `None` when nothing changed.
    fn commit_if_dirty(&self, message: &str) -> Result<Option<String>>;

    /// Merge local branch `source` into local branch `into` by moving or
    /// committing on the `into` ref. The working tree is not touched.
    fn merge(&self, source: &str, into: &str, strategy: MergeStrategy) -> Result<MergeResult>;

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    /// Check `branch` out into a new linked worktree at `path`.
    fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<()>;

    fn remove_worktree(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
    identity: CommitIdentity,
}

impl GitRepo {
    /// Validate that `path` is inside a git repository and bind to it.
    pub fn open(path: &Path, identity: CommitIdentity) -> Result<Self> {
        Repository::open(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            identity,
        })
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.path)
            .with_context(|| format!("Failed to open git repository at {}", self.path.display()))
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Signature::now(&self.identity.name, &self.identity.email)
            .context("Failed to build commit signature")
    }

    fn resolve_commit<'r>(repo: &'r Repository, spec: &str) -> Result<git2::Commit<'r>> {
        if let Ok(branch) = repo.find_branch(spec, BranchType::Local) {
            return branch
                .get()
                .peel_to_commit()
                .with_context(|| format!("Branch '{}' does not point at a commit", spec));
        }
        repo.revparse_single(spec)
            .and_then(|obj| obj.peel_to_commit())
            .with_context(|| format!("Failed to resolve '{}' to a commit", spec))
    }
}

fn in_state_dir(path: &Path) -> bool {
    path.starts_with(STATE_DIR)
}

impl GitCapability for GitRepo {
    fn workdir(&self) -> &Path {
        &self.path
    }

    fn create_branch(&self, name: &str, from_ref: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = Self::resolve_commit(&repo, from_ref)?;
        repo.branch(name, &commit, false)
            .with_context(|| format!("Failed to create branch '{}'", name))?;
        Ok(commit.id().to_string())
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        match repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to look up branch '{}'", name)),
        }
    }

    fn branch_tip(&self, name: &str) -> Result<String> {
        let repo = self.repo()?;
        let branch = repo
            .find_branch(name, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", name))?;
        let commit = branch.get().peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let refname = format!("refs/heads/{}", branch);
        let target = repo
            .revparse_single(&refname)
            .with_context(|| format!("Branch '{}' not found", branch))?;
        let mut opts = CheckoutBuilder::new();
        opts.safe();
        repo.checkout_tree(&target, Some(&mut opts))
            .with_context(|| format!("Failed to check out '{}'", branch))?;
        repo.set_head(&refname)
            .with_context(|| format!("Failed to move HEAD to '{}'", branch))?;
        Ok(())
    }

    fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .context("Repository has no HEAD commit")?;
        Ok(commit.id().to_string())
    }

    fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = repo.head().context("Repository has no HEAD")?;
        if !head.is_branch() {
            return Ok(None);
        }
        Ok(head.shorthand().map(str::to_string))
    }

    fn is_dirty(&self) -> Result<bool> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .exclude_submodules(true);
        let statuses = repo
            .statuses(Some(&mut opts))
            .context("Failed to read repository status")?;
        Ok(statuses.iter().any(|entry| {
            let status = entry.status();
            status != Status::CURRENT
                && !status.contains(Status::IGNORED)
                && !entry.path().is_some_and(|p| in_state_dir(Path::new(p)))
        }))
    }

    fn commit_if_dirty(&self, message: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let mut index = repo.index().context("Failed to open index")?;
        let mut skip_state = |path: &Path, _spec: &[u8]| -> i32 {
            if in_state_dir(path) { 1 } else { 0 }
        };
        index
            .add_all(
                ["*"].iter(),
                IndexAddOption::DEFAULT,
                Some(&mut skip_state as &mut IndexMatchedPath),
            )
            .context("Failed to stage changes")?;
        // add_all does not stage deletions.
        index
            .update_all(["*"].iter(), Some(&mut skip_state as &mut IndexMatchedPath))
            .context("Failed to stage deletions")?;
        index.write().context("Failed to write index")?;

        let tree_id = index.write_tree().context("Failed to write tree")?;
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .context("Failed to commit changes")?;
        Ok(Some(oid.to_string()))
    }

    fn merge(&self, source: &str, into: &str, strategy: MergeStrategy) -> Result<MergeResult> {
        let repo = self.repo()?;
        let source_commit = Self::resolve_commit(&repo, source)?;
        let target_commit = Self::resolve_commit(&repo, into)?;
        let target_ref = format!("refs/heads/{}", into);

        match strategy {
            MergeStrategy::FastForward => {
                let (src, dst) = (source_commit.id(), target_commit.id());
                if src != dst && !repo.graph_descendant_of(src, dst)? {
                    anyhow::bail!("Cannot fast-forward '{}' to '{}': histories diverged", into, source);
                }
                repo.reference(
                    &target_ref,
                    src,
                    true,
                    &format!("trunkline: fast-forward {} to {}", into, source),
                )
                .with_context(|| format!("Failed to fast-forward '{}'", into))?;
                Ok(MergeResult::FastForwarded {
                    head: src.to_string(),
                })
            }
            MergeStrategy::MergeCommit => {
                let mut index = repo
                    .merge_commits(&target_commit, &source_commit, None)
                    .with_context(|| format!("Failed to merge '{}' into '{}'", source, into))?;
                if index.has_conflicts() {
                    let paths = index
                        .conflicts()?
                        .filter_map(|c| c.ok())
                        .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                        .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                        .collect();
                    return Ok(MergeResult::Conflict { paths });
                }
                let tree_id = index
                    .write_tree_to(&repo)
                    .context("Failed to write merge tree")?;
                let tree = repo.find_tree(tree_id)?;
                let sig = self.signature()?;
                let oid = repo
                    .commit(
                        Some(&target_ref),
                        &sig,
                        &sig,
                        &format!("Merge branch '{}' into {}", source, into),
                        &tree,
                        &[&target_commit, &source_commit],
                    )
                    .context("Failed to write merge commit")?;
                Ok(MergeResult::Merged {
                    commit: oid.to_string(),
                })
            }
        }
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let repo = self.repo()?;
        let a = Self::resolve_commit(&repo, ancestor)?.id();
        let d = Self::resolve_commit(&repo, descendant)?.id();
        if a == d {
            return Ok(true);
        }
        repo.graph_descendant_of(d, a)
            .context("Failed to compare commit ancestry")
    }

    fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let reference = repo
            .find_reference(&format!("refs/heads/{}", branch))
            .with_context(|| format!("Branch '{}' not found", branch))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(name, path, Some(&opts))
            .with_context(|| format!("Failed to add worktree '{}' at {}", name, path.display()))?;
        Ok(())
    }

    fn remove_worktree(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        let worktree = repo
            .find_worktree(name)
            .with_context(|| format!("Worktree '{}' not found", name))?;
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true).working_tree(true);
        worktree
            .prune(Some(&mut opts))
            .with_context(|| format!("Failed to prune worktree '{}'", name))?;
        Ok(())
    }
}
