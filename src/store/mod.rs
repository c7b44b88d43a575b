//! Task store: SQLite persistence for projects, tasks and execution attempts.

pub mod db;
pub mod models;

pub use db::{DbHandle, TaskDb};
