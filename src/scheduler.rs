//! Next-phase selection and staleness detection.

use crate::phase::{PhaseStatus, PlanPhases};
use crate::plan::content_hash;
use crate::retry::{RetryDecision, check_retry};

/// Outcome of [`next_phase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPhase {
    /// Execute the phase at this index
    Run(usize),
    /// The selected failed phase may not be retried automatically
    RetryBlocked { phase_id: String, message: String },
    /// Every phase is done or skipped
    AllComplete,
    /// Pending phases remain but none has all dependencies terminal
    Deadlocked { pending: Vec<String> },
}

/// Select the next phase to execute.
///
/// Priority: an `in-progress` phase (crash resume), then a `failed` phase
/// (subject to the retry guard), then the first `pending` phase whose
/// dependencies are all terminal.
pub fn next_phase(phases: &PlanPhases) -> NextPhase {
    if let Some(index) = phases
        .phases
        .iter()
        .position(|p| p.status == PhaseStatus::InProgress)
    {
        return NextPhase::Run(index);
    }

    if let Some(index) = phases
        .phases
        .iter()
        .position(|p| p.status == PhaseStatus::Failed)
    {
        let phase = &phases.phases[index];
        return match check_retry(phase) {
            RetryDecision::Allow(_) => NextPhase::Run(index),
            RetryDecision::Blocked { message } => NextPhase::RetryBlocked {
                phase_id: phase.id.clone(),
                message,
            },
        };
    }

    let ready = phases.phases.iter().position(|p| {
        p.status == PhaseStatus::Pending
            && p.depends_on.iter().all(|dep| {
                phases
                    .get(dep)
                    .is_some_and(|d| d.status.is_terminal())
            })
    });
    if let Some(index) = ready {
        return NextPhase::Run(index);
    }

    if phases.all_terminal() {
        NextPhase::AllComplete
    } else {
        NextPhase::Deadlocked {
            pending: phases
                .phases
                .iter()
                .filter(|p| !p.status.is_terminal())
                .map(|p| p.id.clone())
                .collect(),
        }
    }
}

/// Whether stored phases still match the live plan text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale { stored_hash: String, current_hash: String },
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Compare the aggregate's stored hash against the live plan text.
pub fn check_staleness(phases: &PlanPhases, plan_text: &str) -> Staleness {
    let current_hash = content_hash(plan_text);
    if current_hash == phases.plan_content_hash {
        Staleness::Fresh
    } else {
        Staleness::Stale {
            stored_hash: phases.plan_content_hash.clone(),
            current_hash,
        }
    }
}
