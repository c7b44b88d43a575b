//! Per-project mutual exclusion for sequential attempts.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Keyed lock table: at most one lease per project, no cross-project
/// interaction.
#[derive(Clone, Default)]
pub struct ProjectLockTable {
    held: Arc<DashMap<i64, i64>>,
}

impl ProjectLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire. `None` means another attempt holds the project.
    pub fn try_acquire(&self, project_id: i64, task_id: i64) -> Option<ProjectLease> {
        match self.held.entry(project_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(task_id);
                tracing::debug!(project_id, task_id, "project queue lock acquired");
                Some(ProjectLease {
                    project_id,
                    task_id,
                    table: self.held.clone(),
                })
            }
        }
    }

    /// Task currently holding the project's lock, if any.
    pub fn holder(&self, project_id: i64) -> Option<i64> {
        self.held.get(&project_id).map(|entry| *entry.value())
    }

    pub fn is_held(&self, project_id: i64) -> bool {
        self.held.contains_key(&project_id)
    }
}

/// Proof of holding a project's lock. Released on drop.
#[derive(Debug)]
pub struct ProjectLease {
    project_id: i64,
    task_id: i64,
    table: Arc<DashMap<i64, i64>>,
}

impl ProjectLease {
    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ProjectLease {
    fn drop(&mut self) {
        // Only remove our own entry.
        self.table
            .remove_if(&self.project_id, |_, holder| *holder == self.task_id);
        tracing::debug!(
            project_id = self.project_id,
            task_id = self.task_id,
            "project queue lock released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_on_same_project_fails() {
        let table = ProjectLockTable::new();
        let lease = table.try_acquire(1, 10).unwrap();
        assert!(table.try_acquire(1, 11).is_none());
        assert_eq!(table.holder(1), Some(10));
        assert_eq!(lease.task_id(), 10);
    }

    #[test]
    fn test_projects_are_independent() {
        let table = ProjectLockTable::new();
        let _a = table.try_acquire(1, 10).unwrap();
        let b = table.try_acquire(2, 20);
        assert!(b.is_some());
        assert!(table.is_held(1));
        assert!(table.is_held(2));
    }

    #[test]
    fn test_release_frees_project() {
        let table = ProjectLockTable::new();
        let lease = table.try_acquire(1, 10).unwrap();
        lease.release();
        assert!(!table.is_held(1));
        assert!(table.try_acquire(1, 11).is_some());
    }

    #[test]
    fn test_dropping_lease_releases() {
        let table = ProjectLockTable::new();
        {
            let _lease = table.try_acquire(3, 30).unwrap();
            assert_eq!(table.holder(3), Some(30));
        }
        assert_eq!(table.holder(3), None);
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let table = ProjectLockTable::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                // Leak winning leases so losers cannot acquire after a release.
                std::thread::spawn(move || table.try_acquire(1, i).map(std::mem::forget).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
