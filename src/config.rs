//! Layered configuration for phaser.
//!
//! Settings are resolved in order: built-in defaults, then
//! `<project>/.phaser/phaser.toml`, then environment variables, then CLI
//! flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! workspace_dir = ".phaser"
//!
//! [agent]
//! claude_cmd = "claude"
//! model = "opus"
//! phase_timeout_secs = 1800
//! skip_permissions = true
//!
//! [audit]
//! fix_attempts = 2
//! loop_threshold = "blocking"
//!
//! [decompose]
//! max_files_per_phase = 4
//!
//! [prompt]
//! inject_context_files = false
//! max_injected_bytes = 65536
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::verdict::{DEFAULT_LOOP_THRESHOLD, Severity};
use crate::plan::decompose::DEFAULT_MAX_FILES_PER_PHASE;

/// Directory (relative to the project) holding the config file and, by
/// default, the workspace.
pub const PHASER_DIR: &str = ".phaser";
pub const CONFIG_FILE: &str = "phaser.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Workspace root; relative paths are resolved against the project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-invocation timeout; 0 disables it
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

fn default_skip_permissions() -> bool {
    true
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            claude_cmd: None,
            model: None,
            phase_timeout_secs: default_phase_timeout_secs(),
            skip_permissions: default_skip_permissions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSection {
    #[serde(default = "default_fix_attempts")]
    pub fix_attempts: u32,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: Severity,
}

fn default_fix_attempts() -> u32 {
    2
}

fn default_loop_threshold() -> Severity {
    DEFAULT_LOOP_THRESHOLD
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            fix_attempts: default_fix_attempts(),
            loop_threshold: default_loop_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposeSection {
    #[serde(default = "default_max_files_per_phase")]
    pub max_files_per_phase: usize,
}

fn default_max_files_per_phase() -> usize {
    DEFAULT_MAX_FILES_PER_PHASE
}

impl Default for DecomposeSection {
    fn default() -> Self {
        Self {
            max_files_per_phase: default_max_files_per_phase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSection {
    #[serde(default)]
    pub inject_context_files: bool,
    #[serde(default = "default_max_injected_bytes")]
    pub max_injected_bytes: usize,
}

fn default_max_injected_bytes() -> usize {
    64 * 1024
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            inject_context_files: false,
            max_injected_bytes: default_max_injected_bytes(),
        }
    }
}

/// On-disk `phaser.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaserToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub decompose: DecomposeSection,
    #[serde(default)]
    pub prompt: PromptSection,
}

impl PhaserToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phaser.toml")
    }

    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        if path.exists() { Self::load(&path) } else { Ok(Self::default()) }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize phaser.toml")
    }

    /// Problems that make the configuration unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.decompose.max_files_per_phase == 0 {
            errors.push("decompose.max_files_per_phase must be at least 1".to_string());
        }
        if self.agent.claude_cmd.as_deref().is_some_and(|c| c.trim().is_empty()) {
            errors.push("agent.claude_cmd must not be empty".to_string());
        }
        errors
    }
}

pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(PHASER_DIR).join(CONFIG_FILE)
}

/// Values supplied on the command line; each wins over file and env.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub workspace_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub claude_cmd: Option<String>,
    pub fix_attempts: Option<u32>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub claude_cmd: String,
    pub model: Option<String>,
    pub phase_timeout: Option<Duration>,
    pub skip_permissions: bool,
    pub fix_attempts: u32,
    pub loop_threshold: Severity,
    pub max_files_per_phase: usize,
    pub inject_context_files: bool,
    pub max_injected_bytes: usize,
    file: PhaserToml,
}

impl Config {
    /// Resolve configuration for `project_dir` using the process environment.
    pub fn load(project_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let file = PhaserToml::load_or_default(&project_dir)?;
        let errors = file.validate();
        if !errors.is_empty() {
            anyhow::bail!("Invalid {}:\n  {}", config_path(&project_dir).display(), errors.join("\n  "));
        }
        Ok(Self::resolve(project_dir, file, |key| std::env::var(key).ok(), cli))
    }

    /// Layer `file`, environment lookups, and CLI overrides.
    pub fn resolve(
        project_dir: PathBuf,
        file: PhaserToml,
        env: impl Fn(&str) -> Option<String>,
        cli: &CliOverrides,
    ) -> Self {
        let workspace = cli
            .workspace_dir
            .clone()
            .or_else(|| env("PHASER_WORKSPACE").map(PathBuf::from))
            .or_else(|| file.project.workspace_dir.clone())
            .unwrap_or_else(|| PathBuf::from(PHASER_DIR));
        let workspace_dir = if workspace.is_absolute() {
            workspace
        } else {
            project_dir.join(workspace)
        };

        let claude_cmd = cli
            .claude_cmd
            .clone()
            .or_else(|| env("PHASER_CLAUDE_CMD"))
            .or_else(|| env("CLAUDE_CMD"))
            .or_else(|| file.agent.claude_cmd.clone())
            .unwrap_or_else(|| "claude".to_string());
        let model = cli
            .model
            .clone()
            .or_else(|| env("PHASER_MODEL"))
            .or_else(|| file.agent.model.clone());

        Self {
            project_dir,
            workspace_dir,
            claude_cmd,
            model,
            phase_timeout: (file.agent.phase_timeout_secs > 0)
                .then(|| Duration::from_secs(file.agent.phase_timeout_secs)),
            skip_permissions: file.agent.skip_permissions,
            fix_attempts: cli.fix_attempts.unwrap_or(file.audit.fix_attempts),
            loop_threshold: file.audit.loop_threshold,
            max_files_per_phase: file.decompose.max_files_per_phase,
            inject_context_files: file.prompt.inject_context_files,
            max_injected_bytes: file.prompt.max_injected_bytes,
            file,
        }
    }

    /// Defaults for `project_dir` with no file, environment, or CLI input.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        Self::resolve(project_dir.into(), PhaserToml::default(), |_| None, &CliOverrides::default())
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.workspace_dir.join("plans")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.plans_dir().join(".phases")
    }

    /// The effective configuration expressed as a `phaser.toml`.
    pub fn effective_toml(&self) -> PhaserToml {
        let mut effective = self.file.clone();
        effective.project.workspace_dir = Some(self.workspace_dir.clone());
        effective.agent.claude_cmd = Some(self.claude_cmd.clone());
        effective.agent.model = self.model.clone();
        effective.audit.fix_attempts = self.fix_attempts;
        effective
    }
}
