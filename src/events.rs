//! Caller-facing callbacks: free-form progress messages and structured run
//! events for live progress UIs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::phase::{PhaseKind, PhaseStatus};

/// Receives human-readable progress at phase start, notable sub-steps,
/// each fix attempt, and rollback.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, message: &str);
}

/// Structured events emitted while a phase runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A phase has started execution.
    PhaseStart {
        plan_id: String,
        phase_id: String,
        title: String,
        kind: PhaseKind,
    },
    /// A phase reached its stored post-run status.
    PhaseComplete {
        plan_id: String,
        phase_id: String,
        status: PhaseStatus,
    },
}

impl RunEvent {
    pub fn phase_id(&self) -> &str {
        match self {
            Self::PhaseStart { phase_id, .. } | Self::PhaseComplete { phase_id, .. } => phase_id,
        }
    }
}
