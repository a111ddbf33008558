//! Typed error hierarchy for the phaser engine.
//!
//! Four enums cover the subsystems that can fail with an `Err`:
//! - `PathError` — context file resolution outside the permitted roots
//! - `StoreError` — phase-state persistence
//! - `DecomposeError` — malformed decompositions (programmer errors)
//! - `EngineError` — failures of the top-level run operation itself
//!
//! Runtime outcomes such as staleness or a blocked retry are not errors;
//! they are variants of [`crate::engine::RunPhaseResult`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors from resolving a context file reference.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("Path '{path}' resolves outside the project and workspace roots")]
    OutOfBounds { path: String },

    #[error("Path '{path}' escapes the permitted roots through a symlink ({resolved})")]
    SymlinkEscape { path: String, resolved: PathBuf },

    #[error("Failed to canonicalize {path}: {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PathError {
    /// Both escape variants are out-of-bounds conditions.
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, Self::OutOfBounds { .. } | Self::SymlinkEscape { .. })
    }
}

/// Errors from the phase store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access phase state at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize phase state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unsupported phase state version {found} (max supported {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Phase state for plan '{plan_id}' is corrupt (json: {json_error}; markdown: {markdown_error})")]
    Corrupt {
        plan_id: String,
        json_error: String,
        markdown_error: String,
    },
}

/// Errors raised while building a phase set. These indicate a bug in the
/// decomposer, not a runtime condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecomposeError {
    #[error("Duplicate phase id '{0}' in decomposition")]
    DuplicatePhaseId(String),

    #[error("Phase '{phase}' depends on unknown phase '{dependency}'")]
    UnknownDependency { phase: String, dependency: String },
}

/// Errors from the top-level engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to read plan file at {path}: {source}")]
    PlanReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No phase '{phase_id}' in plan '{plan_id}'")]
    UnknownPhase { plan_id: String, phase_id: String },

    #[error("No phase state stored for plan '{0}'")]
    NoPhaseState(String),

    #[error("Failed to acquire lock for plan '{plan_id}': {source}")]
    LockFailed {
        plan_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Decompose(#[from] DecomposeError),
}
