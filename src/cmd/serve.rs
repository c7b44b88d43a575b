//! `trunkline serve`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use trunkline::config::TrunklineConfig;
use trunkline::execution::ProcessAgent;
use trunkline::orchestrator::Orchestrator;
use trunkline::server::{ServerConfig, start_server};

use super::open_db;

pub async fn cmd_serve(config: &TrunklineConfig, port: Option<u16>, dev: bool) -> Result<()> {
    let db = open_db(config)?;
    let runner = Arc::new(ProcessAgent::from_config(&config.toml.agent));
    let orchestrator = Orchestrator::new(db, config, runner);

    let recovered = orchestrator.recover_interrupted().await?;
    if recovered > 0 {
        warn!(recovered, "attempts interrupted by the last shutdown were marked failed");
    }

    // Queues edited while no server was running start here.
    for project in orchestrator.list_projects().await? {
        if project.queue_halted {
            info!(project_id = project.id, reason = ?project.halted_reason, "queue halted");
            continue;
        }
        match orchestrator.kick(project.id).await {
            Ok(outcome) => debug!(project_id = project.id, ?outcome, "queue kicked"),
            Err(e) => warn!(project_id = project.id, error = %e, "failed to start queue head"),
        }
    }

    start_server(
        ServerConfig {
            port: port.unwrap_or(config.toml.server.port),
            dev_mode: dev,
        },
        orchestrator,
    )
    .await
}
