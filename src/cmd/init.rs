//! `trunkline init`.

use anyhow::{Context, Result};
use trunkline::config::{TrunklineConfig, TrunklineToml};

use super::open_db;

pub fn cmd_init(config: &TrunklineConfig, force: bool) -> Result<()> {
    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("Failed to create {}", config.state_dir.display())
    })?;

    let config_file = config.config_file();
    let existed = config_file.exists();
    if !existed || force {
        TrunklineToml::default().save(&config_file)?;
    }
    open_db(config)?;

    if existed && !force {
        println!(
            "trunkline already initialized at {}",
            config.state_dir.display()
        );
        println!("Kept existing {}", config_file.display());
        return Ok(());
    }

    println!("Initialized trunkline at {}", config.state_dir.display());
    println!();
    println!("  .trunkline/");
    println!("  ├── trunkline.toml  # queue, workspace, git, agent and server settings");
    println!("  └── trunkline.db    # projects, tasks and attempts");
    println!();
    println!("Next steps:");
    println!("  1. Run `trunkline project add <name>` to register this repository");
    println!("  2. Run `trunkline task add --project <id> --sequential <title>` to queue work");
    println!("  3. Run `trunkline serve` to start executing the queue");
    Ok(())
}
