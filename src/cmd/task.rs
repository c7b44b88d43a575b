//! `trunkline task add|show`.

use anyhow::Result;
use trunkline::config::TrunklineConfig;
use trunkline::errors::QueueError;
use trunkline::store::models::{ExecutionMode, NewTask};

use super::super::TaskCommands;
use super::queue_manager;

pub async fn cmd_task(config: &TrunklineConfig, command: TaskCommands) -> Result<()> {
    let queue = queue_manager(config)?;
    match command {
        TaskCommands::Add {
            project,
            title,
            description,
            sequential,
            target_branch,
        } => {
            let execution_mode = if sequential {
                ExecutionMode::Sequential
            } else {
                ExecutionMode::Parallel
            };
            let task = queue
                .create_task(NewTask {
                    project_id: project,
                    title,
                    description,
                    execution_mode,
                    target_branch,
                })
                .await?;
            match task.queue_position {
                Some(position) => println!(
                    "Created task {} '{}' at queue position {}",
                    task.id, task.title, position
                ),
                None => println!("Created task {} '{}'", task.id, task.title),
            }
        }
        TaskCommands::Show { id } => {
            let (task, attempts) = queue
                .db()
                .call(move |db| {
                    let task = db.get_task(id)?.ok_or(QueueError::TaskNotFound { id })?;
                    Ok::<_, QueueError>((task, db.list_attempts(id)?))
                })
                .await?;
            println!("Task {}: {}", task.id, task.title);
            println!("  status:    {}", task.status.as_str());
            println!("  mode:      {}", task.execution_mode.as_str());
            if let Some(position) = task.queue_position {
                println!("  position:  {}", position);
            }
            println!("  target:    {}", task.target_branch);
            if let Some(branch) = &task.task_branch {
                println!("  branch:    {}", branch);
            }
            if attempts.is_empty() {
                return Ok(());
            }
            println!();
            println!("{:<6} {:<10} {:<24} {:<10} Error", "Run", "Outcome", "Branch", "Head");
            for attempt in attempts {
                let head = attempt
                    .after_head_commit
                    .as_deref()
                    .map(|sha| sha.chars().take(8).collect::<String>())
                    .unwrap_or_default();
                let error = match (attempt.error_kind, attempt.error_message) {
                    (Some(kind), Some(msg)) => format!("{}: {}", kind, msg),
                    (Some(kind), None) => kind.to_string(),
                    _ => String::new(),
                };
                println!(
                    "{:<6} {:<10} {:<24} {:<10} {}",
                    attempt.id,
                    attempt.outcome.as_str(),
                    attempt.task_branch.unwrap_or_default(),
                    head,
                    console::style(error).red()
                );
            }
        }
    }
    Ok(())
}
