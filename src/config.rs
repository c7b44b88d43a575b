//! Configuration for trunkline, read from `.trunkline/trunkline.toml`.
//!
//! Every field is optional. Values are layered file → environment
//! (`TRUNKLINE_*`) → CLI flags, the last one set wins.
//!
//! # Configuration File Format
//!
//! ```toml
//! [queue]
//! race_retries = 1
//! race_backoff_ms = 25
//!
//! [workspace]
//! root = "/var/tmp/trunkline-workspaces"
//! branch_prefix = "trunkline"
//! collision_budget = 5
//!
//! [git]
//! author_name = "trunkline"
//! author_email = "trunkline@localhost"
//!
//! [agent]
//! command = "claude"
//! args = ["--print"]
//!
//! [server]
//! port = 3141
//! db_path = "/var/lib/trunkline/trunkline.db"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::git::{CommitIdentity, STATE_DIR};

pub const CONFIG_FILE: &str = "trunkline.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retries after a lost optimistic-concurrency race.
    #[serde(default = "default_race_retries")]
    pub race_retries: u32,
    /// Base backoff between race retries, multiplied by the attempt number.
    #[serde(default = "default_race_backoff_ms")]
    pub race_backoff_ms: u64,
}

fn default_race_retries() -> u32 {
    1
}

fn default_race_backoff_ms() -> u64 {
    25
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            race_retries: default_race_retries(),
            race_backoff_ms: default_race_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Where workspace links and parallel worktrees are created.
    /// Defaults to `.trunkline/workspaces` under the project directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// How many numeric suffixes to try when a branch name is taken.
    #[serde(default = "default_collision_budget")]
    pub collision_budget: u32,
}

fn default_branch_prefix() -> String {
    "trunkline".to_string()
}

fn default_collision_budget() -> u32 {
    5
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            branch_prefix: default_branch_prefix(),
            collision_budget: default_collision_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_author_name() -> String {
    CommitIdentity::default().name
}

fn default_author_email() -> String {
    CommitIdentity::default().email
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments placed before the task prompt.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--print".to_string()]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to `.trunkline/trunkline.db` under the project directory.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: None,
        }
    }
}

/// Parsed `trunkline.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrunklineToml {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerSection,
}

impl TrunklineToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse trunkline.toml")
    }

    /// Returns defaults when the file doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize trunkline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `TRUNKLINE_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TRUNKLINE_RACE_RETRIES") {
            self.queue.race_retries = v
                .parse()
                .with_context(|| format!("Invalid TRUNKLINE_RACE_RETRIES '{}'", v))?;
        }
        if let Some(v) = lookup("TRUNKLINE_WORKSPACE_ROOT") {
            self.workspace.root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TRUNKLINE_BRANCH_PREFIX") {
            self.workspace.branch_prefix = v;
        }
        if let Some(v) = lookup("TRUNKLINE_AGENT_CMD").or_else(|| lookup("CLAUDE_CMD")) {
            self.agent.command = v;
        }
        if let Some(v) = lookup("TRUNKLINE_PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("Invalid TRUNKLINE_PORT '{}'", v))?;
        }
        if let Some(v) = lookup("TRUNKLINE_DB_PATH") {
            self.server.db_path = Some(PathBuf::from(v));
        }
        Ok(())
    }
}

/// Resolved configuration bound to a project directory.
#[derive(Debug, Clone)]
pub struct TrunklineConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: TrunklineToml,
}

impl TrunklineConfig {
    /// Load file and environment layers for `project_dir`.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = TrunklineToml::load_or_default(&state_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;
        Ok(Self {
            project_dir,
            state_dir,
            toml,
        })
    }

    /// Defaults rooted at `project_dir`, without touching file or environment.
    pub fn with_defaults(project_dir: PathBuf) -> Self {
        let state_dir = project_dir.join(STATE_DIR);
        Self {
            project_dir,
            state_dir,
            toml: TrunklineToml::default(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.toml
            .server
            .db_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("trunkline.db"))
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.toml
            .workspace
            .root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("workspaces"))
    }

    pub fn commit_identity(&self) -> CommitIdentity {
        CommitIdentity {
            name: self.toml.git.author_name.clone(),
            email: self.toml.git.author_email.clone(),
        }
    }
}
