//! `trunkline project add|list`.

use anyhow::Result;
use trunkline::config::TrunklineConfig;
use trunkline::orchestrator::register_project;

use super::super::ProjectCommands;
use super::open_db;

pub async fn cmd_project(config: &TrunklineConfig, command: ProjectCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        ProjectCommands::Add { name, path, branch } => {
            let path = path.unwrap_or_else(|| config.project_dir.clone());
            let project = register_project(&db, &name, &path, branch.as_deref()).await?;
            println!(
                "Registered project {} '{}' at {} (target branch {})",
                project.id, project.name, project.path, project.default_target_branch
            );
        }
        ProjectCommands::List => {
            let projects = db.call(|db| db.list_projects()).await?;
            if projects.is_empty() {
                println!("No projects. Run `trunkline project add <name>` first.");
                return Ok(());
            }
            println!("{:<5} {:<20} {:<15} {:<9} Path", "ID", "Name", "Branch", "Queue");
            for project in projects {
                let queue = if project.queue_halted {
                    console::style("halted").red().to_string()
                } else {
                    "running".to_string()
                };
                println!(
                    "{:<5} {:<20} {:<15} {:<9} {}",
                    project.id, project.name, project.default_target_branch, queue, project.path
                );
                if let Some(reason) = project.halted_reason {
                    println!("      {}", console::style(reason).dim());
                }
            }
        }
    }
    Ok(())
}
