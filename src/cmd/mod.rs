//! CLI command implementations.
//!
//! | Module   | Commands handled                  |
//! |----------|-----------------------------------|
//! | `run`    | `Run`                             |
//! | `phase`  | `Status`, `Decompose`, `Skip`     |
//! | `config` | `Config`                          |

pub mod config;
pub mod phase;
pub mod run;

pub use config::cmd_config;
pub use phase::{cmd_decompose, cmd_skip, cmd_status};
pub use run::cmd_run;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use phaser::PlanEngine;
use phaser::agent::ClaudeCliRunner;
use phaser::config::{CliOverrides, Config};
use phaser::lock::FileLock;
use phaser::vcs::GitTracker;

use super::Cli;

pub fn load_config(cli: &Cli, project_dir: &Path, fix_attempts: Option<u32>) -> Result<Config> {
    Config::load(
        project_dir,
        &CliOverrides {
            workspace_dir: cli.workspace.clone(),
            model: cli.model.clone(),
            claude_cmd: None,
            fix_attempts,
        },
    )
}

/// Engine wired with the production capabilities.
pub fn build_engine(config: Config) -> PlanEngine {
    let agent = ClaudeCliRunner::new(config.claude_cmd.clone(), config.skip_permissions);
    let tracker = GitTracker::new(&config.project_dir).with_excluded(&config.workspace_dir);
    let lock = FileLock::new(config.state_dir());
    PlanEngine::new(config, Arc::new(agent))
        .with_vcs(Arc::new(tracker))
        .with_lock(Arc::new(lock))
}
