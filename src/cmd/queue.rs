//! `trunkline queue ...`: direct edits of a project's sequential queue.

use anyhow::Result;
use trunkline::config::TrunklineConfig;
use trunkline::store::models::Task;

use super::super::QueueCommands;
use super::queue_manager;

pub async fn cmd_queue(config: &TrunklineConfig, command: QueueCommands) -> Result<()> {
    let queue = queue_manager(config)?;
    match command {
        QueueCommands::List { project, history } => {
            let tasks = if history {
                queue.get_queue_history(project).await?
            } else {
                queue.get_queue(project).await?
            };
            print_queue(&tasks);
        }
        QueueCommands::Enqueue { task } => {
            let task = queue.enqueue(task).await?;
            println!(
                "Task {} queued at position {}",
                task.id,
                task.queue_position.unwrap_or_default()
            );
        }
        QueueCommands::Dequeue { task } => {
            let task = queue.dequeue(task).await?;
            println!("Task {} removed from the queue", task.id);
        }
        QueueCommands::Reorder { task, index } => {
            let tasks = queue.reorder(task, index).await?;
            print_queue(&tasks);
        }
        QueueCommands::Resume { project } => {
            let project = queue.resume(project).await?;
            println!("Queue for project {} resumed", project.id);
            print_start_hint(project.id);
        }
        QueueCommands::Requeue { task } => {
            let task = queue.requeue(task).await?;
            queue.resume(task.project_id).await?;
            println!(
                "Task {} requeued at position {}",
                task.id,
                task.queue_position.unwrap_or_default()
            );
            print_start_hint(task.project_id);
        }
    }
    Ok(())
}

/// The CLI only edits the store; nothing here starts an attempt.
fn print_start_hint(project_id: i64) {
    println!(
        "{}",
        console::style(format!(
            "The head starts on the next `trunkline serve` start, or now via \
             POST /api/projects/{}/queue/resume on a running server.",
            project_id
        ))
        .dim()
    );
}

fn print_queue(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("Queue is empty.");
        return;
    }
    println!("{:<5} {:<5} {:<11} Title", "Pos", "ID", "Status");
    for task in tasks {
        println!(
            "{:<5} {:<5} {:<11} {}",
            task.queue_position.unwrap_or_default(),
            task.id,
            task.status.as_str(),
            task.title
        );
    }
}
