//! Configuration view and initialization — `phaser config`.

use anyhow::{Context, Result};
use std::path::Path;

use phaser::config::{PhaserToml, config_path};

use super::super::{Cli, ConfigCommands};
use super::load_config;

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = load_config(cli, project_dir, None)?;
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# No phaser.toml at {}; showing defaults", path.display());
            }
            println!("# Effective values (with env/CLI overrides)");
            println!();
            print!("{}", config.effective_toml().to_toml()?);
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                println!("phaser.toml already exists at {}", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            std::fs::write(&path, PhaserToml::default().to_toml()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Created phaser.toml at {}", path.display());
        }
    }

    Ok(())
}
