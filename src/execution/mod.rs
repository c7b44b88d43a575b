//! Agent execution: the [`AgentRunner`] seam and the [`ExecutionSupervisor`]
//! that turns a run into a recorded, committed terminal outcome.

pub mod agent;
pub mod supervisor;

pub use agent::{AgentExit, AgentRunner, ProcessAgent};
pub use supervisor::{ExecutionSupervisor, TerminalNotice};
