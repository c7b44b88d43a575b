//! trunkline runs coding-agent tasks against git repositories. Parallel
//! tasks each get their own worktree; sequential tasks form a per-project
//! queue that runs one at a time on the main checkout and merges each
//! finished branch back into its target before the next one starts.

pub mod advancer;
pub mod api;
pub mod config;
pub mod errors;
pub mod events;
pub mod execution;
pub mod git;
pub mod merge;
pub mod orchestrator;
pub mod queue;
pub mod server;
pub mod store;
pub mod workspace;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;
