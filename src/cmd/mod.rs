//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `init`    | `Init`           |
//! | `serve`   | `Serve`          |
//! | `project` | `Project`        |
//! | `task`    | `Task`           |
//! | `queue`   | `Queue`          |

use anyhow::{Context, Result};
use trunkline::config::TrunklineConfig;
use trunkline::events::event_channel;
use trunkline::queue::{QueueManager, RetryPolicy};
use trunkline::store::{DbHandle, TaskDb};

pub mod init;
pub mod project;
pub mod queue;
pub mod serve;
pub mod task;

pub use init::cmd_init;
pub use project::cmd_project;
pub use queue::cmd_queue;
pub use serve::cmd_serve;
pub use task::cmd_task;

/// Open (creating if needed) the configured database.
pub fn open_db(config: &TrunklineConfig) -> Result<DbHandle> {
    let path = config.db_path();
    let db = TaskDb::new(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(DbHandle::new(db))
}

/// Queue manager for one-shot commands. Events go nowhere; a running server
/// picks up the changes on its next read.
pub fn queue_manager(config: &TrunklineConfig) -> Result<QueueManager> {
    Ok(QueueManager::new(
        open_db(config)?,
        RetryPolicy::from(&config.toml.queue),
        event_channel(),
    ))
}
