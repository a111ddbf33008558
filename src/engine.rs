//! The top-level `run_next_phase` operation and operator workflow.
//!
//! One call loads (or creates) a plan's phase state, picks the next eligible
//! phase, executes it, routes audits through the verdict engine and fix
//! loop, persists the result, and returns a typed [`RunPhaseResult`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentObserver, AgentRunner};
use crate::audit::{AuditVerdict, FixContext, FixLoop, FixLoopOutcome};
use crate::config::Config;
use crate::errors::{EngineError, StoreError};
use crate::events::{ProgressReporter, RunEvent};
use crate::executor::{ExecutionOutcome, ExecutorSettings, PhaseExecutor};
use crate::lock::PlanLock;
use crate::paths::{PathResolver, WORKSPACE_PREFIX};
use crate::phase::{PhaseKind, PhaseStatus, PlanPhase, PlanPhases};
use crate::plan::{self, DecomposeOptions};
use crate::retry;
use crate::scheduler::{NextPhase, Staleness, check_staleness, next_phase};
use crate::store::PhaseStore;
use crate::vcs::VersionControl;

/// Terminal outcome of one [`PlanEngine::run_next_phase`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunPhaseResult {
    Done {
        phase_id: String,
        output: String,
        /// The phase the scheduler would pick next, if any
        next_phase: Option<String>,
    },
    Failed {
        phase_id: Option<String>,
        error: String,
    },
    AuditFailed {
        phase_id: String,
        verdict: AuditVerdict,
        /// Unset when the fix loop did not run
        fix_attempts_used: Option<u32>,
        rollback_warning: Option<String>,
    },
    Stale {
        message: String,
    },
    Corrupt {
        message: String,
    },
    RetryBlocked {
        phase_id: String,
        message: String,
    },
    /// Every phase is done or skipped
    NothingToRun,
    /// Pending phases remain but none can ever become eligible
    Deadlocked {
        message: String,
    },
}

impl RunPhaseResult {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
            Self::AuditFailed { .. } => "audit_failed",
            Self::Stale { .. } => "stale",
            Self::Corrupt { .. } => "corrupt",
            Self::RetryBlocked { .. } => "retry_blocked",
            Self::NothingToRun => "nothing_to_run",
            Self::Deadlocked { .. } => "deadlocked",
        }
    }
}

impl fmt::Display for RunPhaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done {
                phase_id, next_phase, ..
            } => match next_phase {
                Some(next) => write!(f, "{} done (next: {})", phase_id, next),
                None => write!(f, "{} done", phase_id),
            },
            Self::Failed {
                phase_id: Some(id),
                error,
            } => write!(f, "{} failed: {}", id, error),
            Self::Failed { phase_id: None, error } => write!(f, "failed: {}", error),
            Self::AuditFailed {
                phase_id,
                verdict,
                fix_attempts_used,
                rollback_warning,
            } => {
                write!(f, "{} audit failed: {}", phase_id, verdict.summary())?;
                if let Some(n) = fix_attempts_used {
                    write!(f, " after {} fix attempt(s)", n)?;
                }
                if let Some(warning) = rollback_warning {
                    write!(f, " (warning: {})", warning)?;
                }
                Ok(())
            }
            Self::Stale { message } | Self::Corrupt { message } | Self::Deadlocked { message } => {
                write!(f, "{}: {}", self.kind(), message)
            }
            Self::RetryBlocked { message, .. } => write!(f, "retry blocked: {}", message),
            Self::NothingToRun => write!(f, "nothing to run: all phases are complete"),
        }
    }
}

/// Result of [`PlanEngine::decompose_plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomposition {
    pub phases: PlanPhases,
    /// False when existing state was returned untouched
    pub created: bool,
}

/// Drives plans phase by phase.
pub struct PlanEngine {
    config: Config,
    store: PhaseStore,
    executor: PhaseExecutor,
    progress: Option<Arc<dyn ProgressReporter>>,
    events: Option<mpsc::Sender<RunEvent>>,
    lock: Option<Arc<dyn PlanLock>>,
}

impl PlanEngine {
    pub fn new(config: Config, agent: Arc<dyn AgentRunner>) -> Self {
        let resolver = PathResolver::new(&config.project_dir, &config.workspace_dir);
        let settings = ExecutorSettings {
            model: config.model.clone(),
            timeout: config.phase_timeout,
            inject_context_files: config.inject_context_files,
            max_injected_bytes: config.max_injected_bytes,
        };
        Self {
            store: PhaseStore::new(config.state_dir()),
            executor: PhaseExecutor::new(agent, resolver, settings),
            config,
            progress: None,
            events: None,
            lock: None,
        }
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.executor = self.executor.with_vcs(Some(vcs));
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.executor = self.executor.with_observer(Some(observer));
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn PlanLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &PhaseStore {
        &self.store
    }

    /// Interpret `plan` as a path, falling back to `<plans_dir>/<plan>.md`.
    pub fn resolve_plan_file(&self, plan: &str) -> PathBuf {
        let direct = PathBuf::from(plan);
        if direct.exists() {
            return direct;
        }
        let named = self.config.plans_dir().join(format!("{}.md", plan));
        if named.exists() { named } else { direct }
    }

    async fn report(&self, message: &str) {
        if let Some(progress) = &self.progress {
            progress.report(message).await;
        }
    }

    async fn emit_event(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            events.send(event).await.ok();
        }
    }

    async fn acquire(&self, plan_id: &str) -> Result<(), EngineError> {
        if let Some(lock) = &self.lock {
            lock.acquire(plan_id).await.map_err(|source| EngineError::LockFailed {
                plan_id: plan_id.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    async fn release(&self, plan_id: &str) {
        if let Some(lock) = &self.lock
            && let Err(e) = lock.release(plan_id).await
        {
            warn!(plan_id, error = %e, "Failed to release plan lock");
        }
    }

    /// How the plan file is recorded in phase state and context lists.
    fn plan_entry(&self, plan_file: &Path) -> String {
        let canonical = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
        let plan = canonical(plan_file);
        if let Ok(rel) = plan.strip_prefix(canonical(&self.config.workspace_dir)) {
            return format!("{}{}", WORKSPACE_PREFIX, rel.to_string_lossy());
        }
        if let Ok(rel) = plan.strip_prefix(canonical(&self.config.project_dir)) {
            return rel.to_string_lossy().into_owned();
        }
        plan.to_string_lossy().into_owned()
    }

    fn read_plan(plan_file: &Path) -> Result<String, EngineError> {
        std::fs::read_to_string(plan_file).map_err(|source| EngineError::PlanReadFailed {
            path: plan_file.to_path_buf(),
            source,
        })
    }

    fn decompose_text(&self, plan_id: &str, plan_file: &Path, plan_text: &str) -> Result<PlanPhases, EngineError> {
        let options = DecomposeOptions::default()
            .with_max_files_per_phase(self.config.max_files_per_phase)
            .with_roots(&self.config.project_dir, &self.config.workspace_dir);
        Ok(plan::decompose(plan_id, &self.plan_entry(plan_file), plan_text, &options)?)
    }

    /// Decompose `plan_file` and persist the result.
    ///
    /// Existing state is returned untouched unless `force` is set, in which
    /// case it is replaced by a fresh decomposition of the current text.
    pub async fn decompose_plan(&self, plan_file: &Path, force: bool) -> Result<Decomposition, EngineError> {
        let plan_id = plan::plan_id_for(plan_file);
        self.acquire(&plan_id).await?;
        let result = self.decompose_locked(&plan_id, plan_file, force);
        self.release(&plan_id).await;
        result
    }

    fn decompose_locked(&self, plan_id: &str, plan_file: &Path, force: bool) -> Result<Decomposition, EngineError> {
        let plan_text = Self::read_plan(plan_file)?;
        if !force && let Some(phases) = self.store.load(plan_id)? {
            return Ok(Decomposition { phases, created: false });
        }
        let phases = self.decompose_text(plan_id, plan_file, &plan_text)?;
        self.store.save(&phases)?;
        info!(plan_id, phases = phases.phases.len(), force, "Decomposed plan");
        Ok(Decomposition { phases, created: true })
    }

    pub fn load_phases(&self, plan_id: &str) -> Result<Option<PlanPhases>, EngineError> {
        Ok(self.store.load(plan_id)?)
    }

    /// Mark a phase `skipped` so the scheduler moves past it.
    pub async fn skip_phase(&self, plan_id: &str, phase_id: &str) -> Result<PlanPhases, EngineError> {
        self.acquire(plan_id).await?;
        let result = self.skip_locked(plan_id, phase_id);
        self.release(plan_id).await;
        let phases = result?;
        self.emit_event(RunEvent::PhaseComplete {
            plan_id: plan_id.to_string(),
            phase_id: phase_id.to_string(),
            status: PhaseStatus::Skipped,
        })
        .await;
        Ok(phases)
    }

    fn skip_locked(&self, plan_id: &str, phase_id: &str) -> Result<PlanPhases, EngineError> {
        let phases = self
            .store
            .load(plan_id)?
            .ok_or_else(|| EngineError::NoPhaseState(plan_id.to_string()))?;
        let phases = phases
            .update(phase_id, |p| PlanPhase {
                status: PhaseStatus::Skipped,
                ..p.clone()
            })
            .ok_or_else(|| EngineError::UnknownPhase {
                plan_id: plan_id.to_string(),
                phase_id: phase_id.to_string(),
            })?;
        self.store.save(&phases)?;
        info!(plan_id, phase_id, "Skipped phase");
        Ok(phases)
    }

    /// Execute the next eligible phase of `plan_file`.
    pub async fn run_next_phase(
        &self,
        plan_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunPhaseResult, EngineError> {
        let plan_id = plan::plan_id_for(plan_file);
        self.acquire(&plan_id).await?;
        let result = self.run_locked(&plan_id, plan_file, cancel).await;
        self.release(&plan_id).await;
        result
    }

    async fn run_locked(
        &self,
        plan_id: &str,
        plan_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunPhaseResult, EngineError> {
        let plan_text = Self::read_plan(plan_file)?;

        let phases = match self.store.load(plan_id) {
            Ok(Some(phases)) => phases,
            Ok(None) => {
                let phases = self.decompose_text(plan_id, plan_file, &plan_text)?;
                self.store.save(&phases)?;
                info!(plan_id, phases = phases.phases.len(), "Decomposed plan");
                self.report(&format!("Decomposed {} into {} phases", plan_id, phases.phases.len()))
                    .await;
                phases
            }
            Err(e @ StoreError::Corrupt { .. }) => {
                return Ok(RunPhaseResult::Corrupt { message: e.to_string() });
            }
            Err(e) => return Err(e.into()),
        };

        if let Staleness::Stale {
            stored_hash,
            current_hash,
        } = check_staleness(&phases, &plan_text)
        {
            return Ok(RunPhaseResult::Stale {
                message: format!(
                    "Plan '{}' changed since its phases were generated (stored {}, now {}); regenerate the phases to continue",
                    plan_id,
                    &stored_hash[..stored_hash.floor_char_boundary(12)],
                    &current_hash[..12]
                ),
            });
        }

        let index = match next_phase(&phases) {
            NextPhase::Run(index) => index,
            NextPhase::RetryBlocked { phase_id, message } => {
                return Ok(RunPhaseResult::RetryBlocked { phase_id, message });
            }
            NextPhase::AllComplete => return Ok(RunPhaseResult::NothingToRun),
            NextPhase::Deadlocked { pending } => {
                return Ok(RunPhaseResult::Deadlocked {
                    message: format!(
                        "No runnable phase; pending with unsatisfiable dependencies: {}",
                        pending.join(", ")
                    ),
                });
            }
        };

        let previous = &phases.phases[index];
        let previous_failure = (previous.status == PhaseStatus::Failed)
            .then(|| previous.failure_hashes.clone())
            .flatten();
        let phase = PlanPhase {
            status: PhaseStatus::InProgress,
            error: None,
            modified_files: None,
            failure_hashes: None,
            ..phases.phases[index].clone()
        };
        let phases = self.replace(&phases, phase.clone())?;
        self.store.save(&phases)?;

        info!(plan_id, phase_id = %phase.id, kind = %phase.kind, "Starting phase");
        self.report(&format!("Starting {}", phase.label())).await;
        self.emit_event(RunEvent::PhaseStart {
            plan_id: plan_id.to_string(),
            phase_id: phase.id.clone(),
            title: phase.title.clone(),
            kind: phase.kind,
        })
        .await;

        let objective = plan::objective(&plan_text);
        let outcome = self.executor.execute(plan_id, &phase, &objective, cancel).await;
        let (updated, result) = match outcome {
            ExecutionOutcome::Cancelled => (
                PlanPhase {
                    status: PhaseStatus::Pending,
                    ..phase.clone()
                },
                RunPhaseResult::Failed {
                    phase_id: Some(phase.id.clone()),
                    error: "cancelled".to_string(),
                },
            ),
            ExecutionOutcome::Failed {
                error,
                modified_files,
                failure_hashes,
            } => {
                warn!(plan_id, phase_id = %phase.id, error = %error, "Phase failed");
                // Same fingerprints as last time: the retry made no progress
                let (error, modified_files) =
                    if retry::repeats_failure(previous_failure.as_ref(), failure_hashes.as_ref()) {
                        (format!("{} (no changes since the previous failed attempt)", error), None)
                    } else {
                        (error, modified_files)
                    };
                (
                    PlanPhase {
                        status: PhaseStatus::Failed,
                        error: Some(error.clone()),
                        modified_files,
                        failure_hashes,
                        ..phase.clone()
                    },
                    RunPhaseResult::Failed {
                        phase_id: Some(phase.id.clone()),
                        error,
                    },
                )
            }
            ExecutionOutcome::Completed {
                output,
                commit,
                modified_files,
            } => {
                let completed = PlanPhase {
                    output: Some(output.clone()),
                    git_commit: commit,
                    modified_files,
                    ..phase.clone()
                };
                if phase.kind == PhaseKind::Audit {
                    self.finish_audit(plan_id, &phases, completed, &objective, cancel).await
                } else {
                    (
                        PlanPhase {
                            status: PhaseStatus::Done,
                            ..completed
                        },
                        RunPhaseResult::Done {
                            phase_id: phase.id.clone(),
                            output,
                            next_phase: None,
                        },
                    )
                }
            }
        };

        let status = updated.status;
        let phases = self.replace(&phases, updated)?;
        self.store.save(&phases)?;
        self.emit_event(RunEvent::PhaseComplete {
            plan_id: plan_id.to_string(),
            phase_id: phase.id.clone(),
            status,
        })
        .await;
        info!(plan_id, phase_id = %phase.id, status = %status, "Phase finished");

        Ok(match result {
            RunPhaseResult::Done { phase_id, output, .. } => RunPhaseResult::Done {
                phase_id,
                output,
                next_phase: match next_phase(&phases) {
                    NextPhase::Run(i) => Some(phases.phases[i].id.clone()),
                    _ => None,
                },
            },
            other => other,
        })
    }

    fn replace(&self, phases: &PlanPhases, phase: PlanPhase) -> Result<PlanPhases, EngineError> {
        let id = phase.id.clone();
        phases
            .update(&id, move |_| phase)
            .ok_or_else(|| EngineError::UnknownPhase {
                plan_id: phases.plan_id.clone(),
                phase_id: id,
            })
    }

    /// Grade a completed audit and run the fix loop when it fails.
    async fn finish_audit(
        &self,
        plan_id: &str,
        phases: &PlanPhases,
        audit: PlanPhase,
        objective: &str,
        cancel: &CancellationToken,
    ) -> (PlanPhase, RunPhaseResult) {
        let output = audit.output.clone().unwrap_or_default();
        let verdict = AuditVerdict::from_output(&output, self.config.loop_threshold);
        info!(plan_id, phase_id = %audit.id, verdict = %verdict.summary(), "Audit graded");

        if !verdict.should_loop {
            return (
                PlanPhase {
                    status: PhaseStatus::Done,
                    ..audit.clone()
                },
                RunPhaseResult::Done {
                    phase_id: audit.id,
                    output,
                    next_phase: None,
                },
            );
        }
        self.report(&verdict.summary()).await;

        let modified: Vec<String> = phases
            .phases
            .iter()
            .filter_map(|p| p.modified_files.as_ref())
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let ctx = FixContext {
            plan_id,
            audit: &audit,
            objective,
            modified_files: &modified,
        };
        let fix_loop = FixLoop::new(&self.executor, self.config.fix_attempts, self.config.loop_threshold)
            .with_progress(self.progress.as_deref());

        let failed = |verdict: &AuditVerdict| PlanPhase {
            status: PhaseStatus::Failed,
            error: Some(verdict.summary()),
            ..audit.clone()
        };

        match fix_loop.run(&ctx, verdict.clone(), cancel).await {
            FixLoopOutcome::Skipped => (
                failed(&verdict),
                RunPhaseResult::AuditFailed {
                    phase_id: audit.id.clone(),
                    verdict,
                    fix_attempts_used: None,
                    rollback_warning: None,
                },
            ),
            FixLoopOutcome::Passed {
                output,
                attempts_used,
                commit,
                ..
            } => {
                self.report(&format!("Re-audit passed after {} fix attempt(s)", attempts_used))
                    .await;
                (
                    PlanPhase {
                        status: PhaseStatus::Done,
                        output: Some(output.clone()),
                        git_commit: commit.or_else(|| audit.git_commit.clone()),
                        ..audit.clone()
                    },
                    RunPhaseResult::Done {
                        phase_id: audit.id.clone(),
                        output,
                        next_phase: None,
                    },
                )
            }
            FixLoopOutcome::Exhausted {
                verdict,
                attempts_used,
                rollback_warning,
            } => (
                failed(&verdict),
                RunPhaseResult::AuditFailed {
                    phase_id: audit.id.clone(),
                    verdict,
                    fix_attempts_used: Some(attempts_used),
                    rollback_warning,
                },
            ),
            FixLoopOutcome::Cancelled { .. } => (
                PlanPhase {
                    status: PhaseStatus::Pending,
                    ..audit.clone()
                },
                RunPhaseResult::Failed {
                    phase_id: Some(audit.id.clone()),
                    error: "cancelled".to_string(),
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentEvent;
    use crate::testing::{FakeAgent, FakeVcs};
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const PLAN: &str = "# Rate limiting\n\n## Objective\nThrottle requests.\n\n## Changes\n- `src/limiter.rs`: add a token bucket\n";

    fn setup() -> (TempDir, Config, PathBuf) {
        let dir = tempdir().unwrap();
        let config = Config::for_project(dir.path());
        fs::create_dir_all(config.plans_dir()).unwrap();
        let plan = config.plans_dir().join("rate-limit.md");
        fs::write(&plan, PLAN).unwrap();
        (dir, config, plan)
    }

    fn text(s: &str) -> Vec<AgentEvent> {
        vec![AgentEvent::FinalText(s.into())]
    }

    #[tokio::test]
    async fn test_first_run_decomposes_and_runs_first_phase() {
        let (_dir, config, plan) = setup();
        let agent = FakeAgent::new().respond(text("implemented"));
        let engine = PlanEngine::new(config, Arc::new(agent.clone()));

        let result = engine.run_next_phase(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            result,
            RunPhaseResult::Done {
                phase_id: "phase-01".into(),
                output: "implemented".into(),
                next_phase: Some("phase-02".into()),
            }
        );
        let phases = engine.load_phases("rate-limit").unwrap().unwrap();
        assert_eq!(phases.plan_file, "workspace/plans/rate-limit.md");
        assert_eq!(phases.phases[0].status, PhaseStatus::Done);
        assert_eq!(phases.phases[0].output.as_deref(), Some("implemented"));
        assert_eq!(agent.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_plan_is_not_executed() {
        let (_dir, config, plan) = setup();
        let agent = FakeAgent::new();
        let engine = PlanEngine::new(config, Arc::new(agent.clone()));
        engine.decompose_plan(&plan, false).await.unwrap();
        fs::write(&plan, format!("{}\n- `src/extra.rs`: more\n", PLAN)).unwrap();

        let result = engine.run_next_phase(&plan, &CancellationToken::new()).await.unwrap();
        assert!(matches!(result, RunPhaseResult::Stale { .. }), "{:?}", result);
        assert!(agent.requests().is_empty());

        let regenerated = engine.decompose_plan(&plan, true).await.unwrap();
        assert!(regenerated.created);
        assert!(matches!(
            engine.run_next_phase(&plan, &CancellationToken::new()).await.unwrap(),
            RunPhaseResult::Done { .. }
        ));
    }

    #[tokio::test]
    async fn test_failure_without_evidence_blocks_retry() {
        let (_dir, config, plan) = setup();
        let agent = FakeAgent::new().respond(vec![AgentEvent::Error("compile error".into())]);
        let engine = PlanEngine::new(config, Arc::new(agent));

        let first = engine.run_next_phase(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            first,
            RunPhaseResult::Failed {
                phase_id: Some("phase-01".into()),
                error: "compile error".into()
            }
        );
        match engine.run_next_phase(&plan, &CancellationToken::new()).await.unwrap() {
            RunPhaseResult::RetryBlocked { phase_id, message } => {
                assert_eq!(phase_id, "phase-01");
                assert!(message.contains("modifiedFiles"));
            }
            other => panic!("Expected RetryBlocked, got {:?}", other),
        }

        engine.skip_phase("rate-limit", "phase-01").await.unwrap();
        let phases = engine.load_phases("rate-limit").unwrap().unwrap();
        assert_eq!(phases.phases[0].status, PhaseStatus::Skipped);
    }

    #[tokio::test]
    async fn test_repeated_identical_failure_blocks_retry() {
        let (_dir, config, plan) = setup();
        let vcs = FakeVcs::new();
        let agent = FakeAgent::new()
            .respond(vec![AgentEvent::Error("compile error".into())])
            .respond(vec![AgentEvent::Error("compile error".into())])
            .on_run({
                let vcs = vcs.clone();
                move |_| vcs.touch("src/limiter.rs")
            });
        let engine = PlanEngine::new(config, Arc::new(agent.clone())).with_vcs(Arc::new(vcs));
        let cancel = CancellationToken::new();

        engine.run_next_phase(&plan, &cancel).await.unwrap();
        let phases = engine.load_phases("rate-limit").unwrap().unwrap();
        assert_eq!(phases.phases[0].modified_files, Some(vec!["src/limiter.rs".to_string()]));

        // The retry is allowed, but leaves the tree exactly as before
        match engine.run_next_phase(&plan, &cancel).await.unwrap() {
            RunPhaseResult::Failed { error, .. } => assert!(error.contains("no changes since")),
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(matches!(
            engine.run_next_phase(&plan, &cancel).await.unwrap(),
            RunPhaseResult::RetryBlocked { .. }
        ));
        assert_eq!(agent.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_context_file_outside_roots_fails_phase() {
        let (_dir, config, plan) = setup();
        fs::write(
            &plan,
            "# Exfiltrate\n\n## Change Manifest\n```json\n[\"../../etc/passwd\"]\n```\n",
        )
        .unwrap();
        let agent = FakeAgent::new().respond(text("edited"));
        let engine = PlanEngine::new(config, Arc::new(agent.clone()));

        match engine.run_next_phase(&plan, &CancellationToken::new()).await.unwrap() {
            RunPhaseResult::Failed { phase_id, error } => {
                assert_eq!(phase_id.as_deref(), Some("phase-01"));
                assert!(error.contains("../../etc/passwd"), "{}", error);
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(agent.requests().is_empty());
        let phases = engine.load_phases("rate-limit").unwrap().unwrap();
        assert_eq!(phases.phases[0].status, PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_phase_returns_to_pending() {
        let (_dir, config, plan) = setup();
        let engine = PlanEngine::new(config, Arc::new(FakeAgent::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.run_next_phase(&plan, &cancel).await.unwrap();
        assert_eq!(
            result,
            RunPhaseResult::Failed {
                phase_id: Some("phase-01".into()),
                error: "cancelled".into()
            }
        );
        let phases = engine.load_phases("rate-limit").unwrap().unwrap();
        assert_eq!(phases.phases[0].status, PhaseStatus::Pending);
    }

    #[tokio::test]
    async fn test_blocking_audit_without_vcs_fails_immediately() {
        let (_dir, config, plan) = setup();
        let agent = FakeAgent::new()
            .respond(text("implemented"))
            .respond(text("- [blocking] limiter is never called"));
        let engine = PlanEngine::new(config, Arc::new(agent.clone()));
        let cancel = CancellationToken::new();

        engine.run_next_phase(&plan, &cancel).await.unwrap();
        match engine.run_next_phase(&plan, &cancel).await.unwrap() {
            RunPhaseResult::AuditFailed {
                phase_id,
                verdict,
                fix_attempts_used,
                ..
            } => {
                assert_eq!(phase_id, "phase-02");
                assert_eq!(verdict.max_severity, Some(crate::audit::Severity::Blocking));
                assert_eq!(fix_attempts_used, None);
            }
            other => panic!("Expected AuditFailed, got {:?}", other),
        }
        assert_eq!(agent.requests().len(), 2);
        let phases = engine.load_phases("rate-limit").unwrap().unwrap();
        assert_eq!(phases.phases[1].status, PhaseStatus::Failed);
        assert!(phases.phases[1].error.as_deref().unwrap().contains("blocking"));
    }

    #[tokio::test]
    async fn test_fix_loop_exhaustion_rolls_back() {
        let (_dir, config, plan) = setup();
        let vcs = FakeVcs::new();
        let agent = FakeAgent::new()
            .respond(text("implemented"))
            .respond(text("[blocking] broken"))
            .respond(text("fix 1"))
            .respond(text("[blocking] still broken"))
            .respond(text("fix 2"))
            .respond(text("[blocking] still broken"))
            .on_run({
                let vcs = vcs.clone();
                move |request| {
                    if request.prompt.contains("Fix attempt") {
                        vcs.touch("src/limiter.rs");
                    }
                }
            });
        let engine = PlanEngine::new(config, Arc::new(agent.clone())).with_vcs(Arc::new(vcs.clone()));
        let cancel = CancellationToken::new();

        engine.run_next_phase(&plan, &cancel).await.unwrap();
        let result = engine.run_next_phase(&plan, &cancel).await.unwrap();
        match &result {
            RunPhaseResult::AuditFailed {
                fix_attempts_used,
                rollback_warning,
                ..
            } => {
                assert_eq!(*fix_attempts_used, Some(2));
                assert!(rollback_warning.is_none());
            }
            other => panic!("Expected AuditFailed, got {:?}", other),
        }
        assert_eq!(vcs.resets().len(), 1);
        assert!(vcs.changed_files().unwrap().is_empty());
        let fix_requests = agent
            .requests()
            .iter()
            .filter(|r| r.prompt.contains("Fix attempt"))
            .count();
        assert_eq!(fix_requests, 2);
    }

    #[tokio::test]
    async fn test_events_and_nothing_to_run() {
        let (_dir, config, plan) = setup();
        let (tx, mut rx) = mpsc::channel(16);
        let agent = FakeAgent::new()
            .respond(text("implemented"))
            .respond(text("- (minor) naming"));
        let engine = PlanEngine::new(config, Arc::new(agent)).with_events(tx);
        let cancel = CancellationToken::new();

        engine.run_next_phase(&plan, &cancel).await.unwrap();
        let audit = engine.run_next_phase(&plan, &cancel).await.unwrap();
        assert!(audit.is_done());
        assert_eq!(
            engine.run_next_phase(&plan, &cancel).await.unwrap(),
            RunPhaseResult::NothingToRun
        );

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event);
        }
        assert_eq!(kinds.len(), 4);
        assert!(matches!(kinds[0], RunEvent::PhaseStart { kind: PhaseKind::Implement, .. }));
        assert!(matches!(
            kinds[3],
            RunEvent::PhaseComplete {
                status: PhaseStatus::Done,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let (_dir, config, plan) = setup();
        let engine = PlanEngine::new(config, Arc::new(FakeAgent::new()));
        engine.decompose_plan(&plan, false).await.unwrap();
        fs::write(engine.store().json_path("rate-limit"), "{ not json").unwrap();
        fs::write(engine.store().markdown_path("rate-limit"), "garbage").unwrap();

        let result = engine.run_next_phase(&plan, &CancellationToken::new()).await.unwrap();
        assert!(matches!(result, RunPhaseResult::Corrupt { .. }), "{:?}", result);
    }

    #[tokio::test]
    async fn test_missing_plan_is_an_error() {
        let (dir, config, _plan) = setup();
        let engine = PlanEngine::new(config, Arc::new(FakeAgent::new()));
        let err = engine
            .run_next_phase(&dir.path().join("nope.md"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PlanReadFailed { .. }));
    }

    #[tokio::test]
    async fn test_skip_unknown_phase_errors() {
        let (_dir, config, plan) = setup();
        let engine = PlanEngine::new(config, Arc::new(FakeAgent::new()));
        engine.decompose_plan(&plan, false).await.unwrap();
        assert!(matches!(
            engine.skip_phase("rate-limit", "phase-99").await,
            Err(EngineError::UnknownPhase { .. })
        ));
        assert!(matches!(
            engine.skip_phase("other", "phase-01").await,
            Err(EngineError::NoPhaseState(_))
        ));
    }
}
