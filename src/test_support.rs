//! Shared fixtures for unit tests.

use std::fs;
use std::path::Path;

use git2::{Repository, RepositoryInitOptions, Signature};

use crate::store::models::{ExecutionMode, NewTask, Project, Task};
use crate::store::{DbHandle, TaskDb};

/// Initialise a repository on `main` with one commit containing README.md.
/// Returns the commit SHA.
pub fn init_repo(dir: &Path) -> String {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir, &opts).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    drop(config);
    commit_file(dir, "README.md", "# demo\n", "init")
}

/// Write `name` and commit every change on HEAD. Returns the commit SHA.
pub fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> String {
    let repo = Repository::open(dir).unwrap();
    fs::write(dir.join(name), content).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    let oid = match repo.head() {
        Ok(head) => {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap()
        }
        Err(_) => repo
            .commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
            .unwrap(),
    };
    oid.to_string()
}

/// Whether `path` exists in the tree of `branch`'s tip.
pub fn branch_has_file(dir: &Path, branch: &str, path: &str) -> bool {
    let repo = Repository::open(dir).unwrap();
    let branch = repo.find_branch(branch, git2::BranchType::Local).unwrap();
    let tree = branch.get().peel_to_commit().unwrap().tree().unwrap();
    tree.get_path(Path::new(path)).is_ok()
}

pub fn memory_db() -> DbHandle {
    DbHandle::new(TaskDb::new_in_memory().unwrap())
}

pub fn add_project(db: &DbHandle, path: &Path) -> Project {
    db.lock_sync()
        .unwrap()
        .create_project("demo", &path.to_string_lossy(), "main")
        .unwrap()
}

pub fn add_task(db: &DbHandle, project_id: i64, title: &str) -> Task {
    db.lock_sync()
        .unwrap()
        .create_task(
            &NewTask {
                project_id,
                title: title.to_string(),
                description: String::new(),
                execution_mode: ExecutionMode::Parallel,
                target_branch: None,
            },
            "main",
        )
        .unwrap()
}
