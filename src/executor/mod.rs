//! Phase execution: prompt, agent invocation, and commit provenance.

pub mod prompt;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{
    AUDIT_TOOLS, AgentObserver, AgentOutcome, AgentRequest, AgentRunner, FIX_TOOLS, IMPLEMENT_TOOLS,
    READ_TOOLS, invoke,
};
use crate::errors::PathError;
use crate::paths::PathResolver;
use crate::phase::{PhaseKind, PlanPhase};
use crate::plan::content_hash;
use crate::vcs::VersionControl;
use prompt::{build_phase_prompt, inject_context_files};

/// Fingerprint recorded for files removed by a failed attempt.
pub const DELETED_FINGERPRINT: &str = "deleted";

/// Settings that shape every invocation.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub model: Option<String>,
    pub timeout: Option<Duration>,
    pub inject_context_files: bool,
    pub max_injected_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            model: None,
            timeout: None,
            inject_context_files: false,
            max_injected_bytes: 64 * 1024,
        }
    }
}

/// Result of executing one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed {
        output: String,
        commit: Option<String>,
        modified_files: Option<Vec<String>>,
    },
    Failed {
        error: String,
        modified_files: Option<Vec<String>>,
        failure_hashes: Option<BTreeMap<String, String>>,
    },
    Cancelled,
}

/// Files committed by [`PhaseExecutor::commit_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub commit: String,
    pub files: Vec<String>,
}

/// Runs phases against an agent, optionally recording git provenance.
#[derive(Clone)]
pub struct PhaseExecutor {
    agent: Arc<dyn AgentRunner>,
    vcs: Option<Arc<dyn VersionControl>>,
    observer: Option<Arc<dyn AgentObserver>>,
    resolver: PathResolver,
    settings: ExecutorSettings,
}

impl PhaseExecutor {
    pub fn new(agent: Arc<dyn AgentRunner>, resolver: PathResolver, settings: ExecutorSettings) -> Self {
        Self {
            agent,
            vcs: None,
            observer: None,
            resolver,
            settings,
        }
    }

    pub fn with_vcs(mut self, vcs: Option<Arc<dyn VersionControl>>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_observer(mut self, observer: Option<Arc<dyn AgentObserver>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// The version-control capability, if one is present and sees a repository.
    pub fn repository(&self) -> Option<&dyn VersionControl> {
        self.vcs.as_deref().filter(|vcs| vcs.is_repository())
    }

    fn extra_dirs(&self, kind: PhaseKind) -> Vec<PathBuf> {
        match kind {
            // Implementers never get the workspace, which holds the plans
            PhaseKind::Implement => Vec::new(),
            PhaseKind::Read | PhaseKind::Audit => {
                let workspace = self.resolver.workspace_root();
                if workspace.starts_with(self.resolver.project_root()) {
                    Vec::new()
                } else {
                    vec![workspace.to_path_buf()]
                }
            }
        }
    }

    fn tools(kind: PhaseKind) -> &'static [&'static str] {
        match kind {
            PhaseKind::Read => READ_TOOLS,
            PhaseKind::Implement => IMPLEMENT_TOOLS,
            PhaseKind::Audit => AUDIT_TOOLS,
        }
    }

    fn request(&self, prompt: String, tools: &[&str], extra_dirs: Vec<PathBuf>) -> AgentRequest {
        AgentRequest::new(prompt, self.resolver.project_root())
            .with_model(self.settings.model.clone())
            .with_extra_dirs(extra_dirs)
            .with_tools(tools)
            .with_timeout(self.settings.timeout)
    }

    /// Agent request for running `phase`.
    pub fn phase_request(&self, phase: &PlanPhase, objective: &str) -> AgentRequest {
        let injected = if self.settings.inject_context_files {
            inject_context_files(&self.resolver, &phase.context_files, self.settings.max_injected_bytes)
        } else {
            Vec::new()
        };
        let prompt = build_phase_prompt(phase, objective, &injected);
        self.request(prompt, Self::tools(phase.kind), self.extra_dirs(phase.kind))
    }

    /// Agent request for a fix attempt (no shell, no workspace grant).
    pub fn fix_request(&self, prompt: String) -> AgentRequest {
        self.request(prompt, FIX_TOOLS, Vec::new())
    }

    pub async fn run_agent(&self, request: AgentRequest, cancel: &CancellationToken) -> AgentOutcome {
        invoke(self.agent.as_ref(), request, cancel, self.observer.as_deref()).await
    }

    /// Commit pending changes, if a repository is present and anything changed.
    pub fn commit_changes(&self, message: &str) -> anyhow::Result<Option<CommitRecord>> {
        let Some(vcs) = self.repository() else {
            return Ok(None);
        };
        let files = vcs.changed_files()?;
        if files.is_empty() {
            return Ok(None);
        }
        let commit = vcs.commit(message)?;
        Ok(Some(CommitRecord { commit, files }))
    }

    /// Changed files and their fingerprints after a failed attempt.
    pub fn capture_failure(&self) -> (Option<Vec<String>>, Option<BTreeMap<String, String>>) {
        let Some(vcs) = self.repository() else {
            return (None, None);
        };
        let files = match vcs.changed_files() {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => return (None, None),
            Err(e) => {
                warn!(error = %e, "Failed to list changed files after failure");
                return (None, None);
            }
        };
        let hashes = files
            .iter()
            .map(|file| {
                let path = self.resolver.project_root().join(file);
                let fingerprint = match fs::read(&path) {
                    Ok(bytes) => content_hash(&bytes),
                    Err(_) => DELETED_FINGERPRINT.to_string(),
                };
                (file.clone(), fingerprint)
            })
            .collect();
        (Some(files), Some(hashes))
    }

    /// Every context file must resolve inside the project or workspace root.
    pub fn check_context_files(&self, phase: &PlanPhase) -> Result<(), PathError> {
        phase
            .context_files
            .iter()
            .try_for_each(|entry| self.resolver.resolve(entry).map(drop))
    }

    /// Run `phase` to completion and commit whatever it changed.
    ///
    /// A phase whose context files escape the permitted roots fails before
    /// the agent is invoked.
    pub async fn execute(
        &self,
        plan_id: &str,
        phase: &PlanPhase,
        objective: &str,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        if let Err(e) = self.check_context_files(phase) {
            warn!(phase_id = %phase.id, error = %e, "Refusing to run phase");
            return ExecutionOutcome::Failed {
                error: e.to_string(),
                modified_files: None,
                failure_hashes: None,
            };
        }
        let request = self.phase_request(phase, objective);
        debug!(phase_id = %phase.id, tools = ?request.tools, extra_dirs = ?request.extra_dirs, "Invoking agent");

        match self.run_agent(request, cancel).await {
            AgentOutcome::Completed { text } => {
                let message = format!("phaser({}): {} {}", plan_id, phase.id, phase.title);
                match self.commit_changes(&message) {
                    Ok(Some(record)) => {
                        info!(phase_id = %phase.id, commit = %record.commit, files = record.files.len(), "Committed phase changes");
                        ExecutionOutcome::Completed {
                            output: text,
                            commit: Some(record.commit),
                            modified_files: Some(record.files),
                        }
                    }
                    Ok(None) => ExecutionOutcome::Completed {
                        output: text,
                        commit: None,
                        modified_files: None,
                    },
                    Err(e) => {
                        let (modified_files, failure_hashes) = self.capture_failure();
                        ExecutionOutcome::Failed {
                            error: format!("Failed to commit phase changes: {:#}", e),
                            modified_files,
                            failure_hashes,
                        }
                    }
                }
            }
            AgentOutcome::Failed { .. } if cancel.is_cancelled() => ExecutionOutcome::Cancelled,
            AgentOutcome::Failed { error } => {
                let (modified_files, failure_hashes) = self.capture_failure();
                ExecutionOutcome::Failed {
                    error,
                    modified_files,
                    failure_hashes,
                }
            }
        }
    }
}
