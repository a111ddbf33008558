//! Bounded audit → fix → re-audit cycle with rollback on exhaustion.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::verdict::{AuditVerdict, Severity};
use crate::agent::AgentOutcome;
use crate::events::ProgressReporter;
use crate::executor::PhaseExecutor;
use crate::executor::prompt::{FixPromptInput, build_fix_prompt};
use crate::phase::PlanPhase;

/// How a fix loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixLoopOutcome {
    /// No repository, no base commit, or a zero budget; nothing was attempted.
    Skipped,
    /// A re-audit came back below the threshold.
    Passed {
        output: String,
        verdict: AuditVerdict,
        attempts_used: u32,
        commit: Option<String>,
    },
    /// Every attempt failed; the tree was reset to the pre-loop commit.
    Exhausted {
        verdict: AuditVerdict,
        attempts_used: u32,
        rollback_warning: Option<String>,
    },
    Cancelled {
        attempts_used: u32,
        rollback_warning: Option<String>,
    },
}

/// Inputs describing the failing audit.
#[derive(Debug, Clone)]
pub struct FixContext<'a> {
    pub plan_id: &'a str,
    pub audit: &'a PlanPhase,
    pub objective: &'a str,
    /// Files modified by earlier phases
    pub modified_files: &'a [String],
}

pub struct FixLoop<'a> {
    executor: &'a PhaseExecutor,
    progress: Option<&'a dyn ProgressReporter>,
    max_attempts: u32,
    threshold: Severity,
}

impl<'a> FixLoop<'a> {
    pub fn new(executor: &'a PhaseExecutor, max_attempts: u32, threshold: Severity) -> Self {
        Self {
            executor,
            progress: None,
            max_attempts,
            threshold,
        }
    }

    pub fn with_progress(mut self, progress: Option<&'a dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    async fn report(&self, message: &str) {
        if let Some(progress) = self.progress {
            progress.report(message).await;
        }
    }

    /// Hard-reset to `reference`, turning a failure into a warning string.
    async fn rollback(&self, reference: &str) -> Option<String> {
        let vcs = self.executor.repository()?;
        self.report(&format!("Rolling back fix attempts to {}", short_ref(reference))).await;
        match vcs.hard_reset(reference) {
            Ok(()) => None,
            Err(e) => {
                let warning = format!("Rollback to {} failed: {:#}", short_ref(reference), e);
                warn!(reference, error = %e, "Fix loop rollback failed");
                Some(warning)
            }
        }
    }

    pub async fn run(
        &self,
        ctx: &FixContext<'_>,
        initial: AuditVerdict,
        cancel: &CancellationToken,
    ) -> FixLoopOutcome {
        if self.max_attempts == 0 {
            return FixLoopOutcome::Skipped;
        }
        let Some(pre_loop) = self.executor.repository().and_then(|vcs| vcs.head()) else {
            return FixLoopOutcome::Skipped;
        };

        let mut verdict = initial;
        let mut modified: BTreeSet<String> = ctx.modified_files.iter().cloned().collect();

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                let rollback_warning = self.rollback(&pre_loop).await;
                return FixLoopOutcome::Cancelled {
                    attempts_used: attempt - 1,
                    rollback_warning,
                };
            }
            self.report(&format!(
                "Fix attempt {}/{} for {}: {}",
                attempt,
                self.max_attempts,
                ctx.audit.id,
                verdict.summary()
            ))
            .await;

            let findings = verdict.findings_at_least(self.threshold);
            let modified_list: Vec<String> = modified.iter().cloned().collect();
            let prompt = build_fix_prompt(&FixPromptInput {
                objective: ctx.objective,
                findings: &findings,
                modified_files: &modified_list,
                context_files: &ctx.audit.context_files,
                attempt,
                max_attempts: self.max_attempts,
            });
            if let AgentOutcome::Failed { error } = self.executor.run_agent(self.executor.fix_request(prompt), cancel).await {
                // A failed fix still consumes the attempt
                warn!(attempt, error = %error, "Fix agent failed");
                continue;
            }
            if let Some(vcs) = self.executor.repository()
                && let Ok(files) = vcs.changed_files()
            {
                modified.extend(files);
            }

            let request = self.executor.phase_request(ctx.audit, ctx.objective);
            let output = match self.executor.run_agent(request, cancel).await {
                AgentOutcome::Completed { text } => text,
                AgentOutcome::Failed { error } => {
                    warn!(attempt, error = %error, "Re-audit failed");
                    continue;
                }
            };
            verdict = AuditVerdict::from_output(&output, self.threshold);
            if !verdict.should_loop {
                info!(attempt, "Re-audit passed");
                let message = format!("phaser({}): fix {} (attempt {})", ctx.plan_id, ctx.audit.id, attempt);
                let commit = match self.executor.commit_changes(&message) {
                    Ok(record) => record.map(|r| r.commit),
                    Err(e) => {
                        warn!(error = %e, "Failed to commit fix changes");
                        None
                    }
                };
                return FixLoopOutcome::Passed {
                    output,
                    verdict,
                    attempts_used: attempt,
                    commit,
                };
            }
        }

        if cancel.is_cancelled() {
            let rollback_warning = self.rollback(&pre_loop).await;
            return FixLoopOutcome::Cancelled {
                attempts_used: self.max_attempts,
                rollback_warning,
            };
        }
        let rollback_warning = self.rollback(&pre_loop).await;
        FixLoopOutcome::Exhausted {
            verdict,
            attempts_used: self.max_attempts,
            rollback_warning,
        }
    }
}

fn short_ref(reference: &str) -> &str {
    &reference[..reference.floor_char_boundary(12)]
}
