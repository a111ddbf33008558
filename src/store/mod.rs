//! Dual-format phase-state persistence.
//!
//! Each plan's aggregate lives at a deterministic pair of paths under the
//! state directory:
//! - `<plan_id>.phases.json` — versioned, authoritative
//! - `<plan_id>.phases.md` — operator-facing rendering
//!
//! Both are replaced atomically (temp file in the same directory, then
//! rename). Reads prefer JSON, fall back to the markdown rendering, and
//! re-encode the JSON when the fallback succeeds.

pub mod markdown;

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::phase::PlanPhases;

/// Current JSON document version.
pub const STATE_VERSION: u32 = 1;

#[derive(Serialize)]
struct DocumentRef<'a> {
    version: u32,
    #[serde(flatten)]
    phases: &'a PlanPhases,
}

/// Where a successful load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Json,
    /// JSON was unreadable; rebuilt from the markdown rendering
    MarkdownFallback,
}

/// Persists phase aggregates for any number of plans under one directory.
#[derive(Debug, Clone)]
pub struct PhaseStore {
    dir: PathBuf,
}

impl PhaseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn json_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.phases.json"))
    }

    pub fn markdown_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.phases.md"))
    }

    pub fn exists(&self, plan_id: &str) -> bool {
        self.json_path(plan_id).exists() || self.markdown_path(plan_id).exists()
    }

    /// Write both artifacts, JSON first.
    pub fn save(&self, phases: &PlanPhases) -> Result<(), StoreError> {
        let doc = DocumentRef {
            version: STATE_VERSION,
            phases,
        };
        let json = serde_json::to_string_pretty(&doc).map_err(StoreError::Serialize)?;
        write_atomic(&self.json_path(&phases.plan_id), &json)?;
        write_atomic(
            &self.markdown_path(&phases.plan_id),
            &markdown::render(phases, STATE_VERSION),
        )?;
        debug!(plan_id = %phases.plan_id, "Saved phase state");
        Ok(())
    }

    /// Load a plan's aggregate; `Ok(None)` when nothing has been stored.
    pub fn load(&self, plan_id: &str) -> Result<Option<PlanPhases>, StoreError> {
        Ok(self.load_with_source(plan_id)?.map(|(phases, _)| phases))
    }

    /// Like [`load`](Self::load), also reporting which artifact was used.
    pub fn load_with_source(&self, plan_id: &str) -> Result<Option<(PlanPhases, LoadSource)>, StoreError> {
        let json_path = self.json_path(plan_id);
        let md_path = self.markdown_path(plan_id);

        let json_error = match read_optional(&json_path)? {
            Some(text) => match decode_json(&text) {
                Ok(phases) => return Ok(Some((phases, LoadSource::Json))),
                Err(JsonDecode::Version(err)) => return Err(err),
                Err(JsonDecode::Invalid(message)) => message,
            },
            None => "missing".to_string(),
        };

        let markdown_error = match read_optional(&md_path)? {
            Some(text) => match markdown::parse(&text) {
                Ok(phases) => {
                    if json_error == "missing" {
                        warn!(plan_id, "Phase JSON missing; rebuilt from markdown");
                    } else {
                        warn!(plan_id, error = %json_error, "Phase JSON corrupt; rebuilt from markdown");
                    }
                    self.heal(&phases);
                    return Ok(Some((phases, LoadSource::MarkdownFallback)));
                }
                Err(err) => err.to_string(),
            },
            None if json_error == "missing" => return Ok(None),
            None => "missing".to_string(),
        };

        Err(StoreError::Corrupt {
            plan_id: plan_id.to_string(),
            json_error,
            markdown_error,
        })
    }

    /// Re-encode the authoritative JSON from a markdown-recovered aggregate.
    fn heal(&self, phases: &PlanPhases) {
        let doc = DocumentRef {
            version: STATE_VERSION,
            phases,
        };
        let result = serde_json::to_string_pretty(&doc)
            .map_err(StoreError::Serialize)
            .and_then(|json| write_atomic(&self.json_path(&phases.plan_id), &json));
        if let Err(e) = result {
            warn!(plan_id = %phases.plan_id, error = %e, "Failed to rewrite phase JSON");
        }
    }
}

enum JsonDecode {
    Version(StoreError),
    Invalid(String),
}

fn decode_json(text: &str) -> Result<PlanPhases, JsonDecode> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| JsonDecode::Invalid(e.to_string()))?;
    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| JsonDecode::Invalid("missing or invalid 'version'".to_string()))?;
    if version > u64::from(STATE_VERSION) {
        return Err(JsonDecode::Version(StoreError::UnsupportedVersion {
            found: u32::try_from(version).unwrap_or(u32::MAX),
            supported: STATE_VERSION,
        }));
    }
    serde_json::from_value(value).map_err(|e| JsonDecode::Invalid(e.to_string()))
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        // Non-UTF-8 content is corruption, not an I/O failure
        Err(e) if e.kind() == ErrorKind::InvalidData => Ok(Some(String::new())),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Replace `path` with `content` atomically.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    let mut temp = NamedTempFile::new_in(dir).map_err(io_err)?;
    temp.write_all(content.as_bytes()).map_err(io_err)?;
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
