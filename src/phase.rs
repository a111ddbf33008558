//! Phase data model for the plan engine.
//!
//! This module provides:
//! - `PhaseKind` and `PhaseStatus`, strictly parsed from their string forms
//! - `PlanPhase`, one bounded unit of agent work
//! - `PlanPhases`, the per-plan aggregate persisted as a single unit
//!
//! The aggregate is treated as an immutable value: every transition goes
//! through [`PlanPhases::update`], which returns a new aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::errors::DecomposeError;

/// The role a phase plays in executing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    /// Read-only ingestion of the plan and relevant files.
    Read,
    /// Edits the tree according to the phase's change spec.
    Implement,
    /// Compares the tree against the plan and emits a severity verdict.
    Audit,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Implement => "implement",
            Self::Audit => "audit",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "implement" => Ok(Self::Implement),
            "audit" => Ok(Self::Audit),
            _ => anyhow::bail!(
                "Invalid phase kind '{}'. Valid values: read, implement, audit",
                s
            ),
        }
    }
}

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Terminal statuses satisfy dependencies.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Get the emoji indicator for this status.
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Pending => "○",
            Self::InProgress => "◐",
            Self::Done => "✓",
            Self::Failed => "✗",
            Self::Skipped => "↷",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => anyhow::bail!(
                "Invalid phase status '{}'. Valid values: pending, in-progress, done, failed, skipped",
                s
            ),
        }
    }
}

/// One bounded unit of agent work within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPhase {
    /// Stable id derived at decomposition (e.g. "phase-02")
    pub id: String,
    pub title: String,
    pub kind: PhaseKind,
    pub description: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Paths relevant to this phase, `workspace/`-prefixed for workspace files
    #[serde(default)]
    pub context_files: Vec<String>,
    /// Exact plan text describing required edits (implement phases only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_files: Option<Vec<String>>,
    /// File → content fingerprint captured when a failed attempt left writes behind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_hashes: Option<BTreeMap<String, String>>,
}

impl PlanPhase {
    pub fn new(id: &str, title: &str, kind: PhaseKind, description: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            kind,
            description: description.to_string(),
            status: PhaseStatus::Pending,
            depends_on: Vec::new(),
            context_files: Vec::new(),
            change_spec: None,
            output: None,
            error: None,
            git_commit: None,
            modified_files: None,
            failure_hashes: None,
        }
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_context_files(mut self, files: Vec<String>) -> Self {
        self.context_files = files;
        self
    }

    pub fn with_change_spec(mut self, spec: impl Into<String>) -> Self {
        self.change_spec = Some(spec.into());
        self
    }

    /// Short label used in progress messages.
    pub fn label(&self) -> String {
        format!("{} ({}): {}", self.id, self.kind, self.title)
    }
}

/// The per-plan aggregate root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPhases {
    pub plan_id: String,
    pub plan_file: String,
    pub plan_content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phases: Vec<PlanPhase>,
}

impl PlanPhases {
    pub fn new(plan_id: &str, plan_file: &str, plan_content_hash: &str, phases: Vec<PlanPhase>) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan_id.to_string(),
            plan_file: plan_file.to_string(),
            plan_content_hash: plan_content_hash.to_string(),
            created_at: now,
            updated_at: now,
            phases,
        }
    }

    /// Check that ids are unique and every dependency resolves.
    pub fn validate(&self) -> Result<(), DecomposeError> {
        let mut ids = HashSet::new();
        for phase in &self.phases {
            if !ids.insert(phase.id.as_str()) {
                return Err(DecomposeError::DuplicatePhaseId(phase.id.clone()));
            }
        }
        for phase in &self.phases {
            for dep in &phase.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(DecomposeError::UnknownDependency {
                        phase: phase.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PlanPhase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Return a new aggregate with phase `id` transformed by `f`.
    ///
    /// Returns `None` when no phase has that id. The receiver is never
    /// modified.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Self>
    where
        F: FnOnce(&PlanPhase) -> PlanPhase,
    {
        let index = self.position(id)?;
        let mut next = self.clone();
        next.phases[index] = f(&self.phases[index]);
        next.updated_at = Utc::now().max(self.updated_at);
        Some(next)
    }

    /// Count phases by status, in declaration order of `PhaseStatus`.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for phase in &self.phases {
            *counts.entry(phase.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.phases.iter().all(|p| p.status.is_terminal())
    }
}
