//! Human-readable rendering of a phase aggregate.
//!
//! The rendering is for operators, but it also parses back losslessly so the
//! store can rebuild a corrupt JSON document from it. Layout:
//!
//! ```text
//! # Phases: <plan_id>
//!
//! - version: 1
//! - plan_id: "feature"
//! - ...
//!
//! ## Phase `phase-01`: Read the plan
//!
//! - id: "phase-01"
//! - kind: read
//! - status: pending
//! - depends_on: []
//!
//! ### description
//!
//! ~~~
//! free text
//! ~~~
//! ```
//!
//! Scalar and list values are inline JSON; `kind` and `status` are bare and
//! parsed strictly. Free-text fields sit in tilde fences longer than any
//! tilde run in their content.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::phase::{PhaseKind, PhaseStatus, PlanPhase, PlanPhases};

#[derive(Debug, Error)]
pub enum MarkdownError {
    #[error("line {line}: {message}")]
    Invalid { line: usize, message: String },

    #[error("missing field '{field}'{}", .phase.as_ref().map(|p| format!(" in phase '{p}'")).unwrap_or_default())]
    MissingField {
        field: &'static str,
        phase: Option<String>,
    },
}

const TEXT_FIELDS: &[&str] = &["description", "change_spec", "output", "error"];

fn json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn fence_for(content: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in content.chars() {
        if c == '~' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "~".repeat((longest + 1).max(3))
}

fn write_text(out: &mut String, field: &str, content: &str) {
    let fence = fence_for(content);
    let _ = write!(out, "### {field}\n\n{fence}\n{content}\n{fence}\n\n");
}

/// Render the aggregate as markdown.
pub fn render(phases: &PlanPhases, version: u32) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Phases: {}\n", phases.plan_id);
    let _ = writeln!(out, "- version: {}", version);
    let _ = writeln!(out, "- plan_id: {}", json(&phases.plan_id));
    let _ = writeln!(out, "- plan_file: {}", json(&phases.plan_file));
    let _ = writeln!(out, "- plan_content_hash: {}", json(&phases.plan_content_hash));
    let _ = writeln!(out, "- created_at: {}", json(&phases.created_at));
    let _ = writeln!(out, "- updated_at: {}", json(&phases.updated_at));
    out.push('\n');

    for phase in &phases.phases {
        let _ = writeln!(
            out,
            "## Phase `{}`: {} {}\n",
            phase.id,
            phase.status.emoji(),
            phase.title.replace('\n', " ")
        );
        let _ = writeln!(out, "- id: {}", json(&phase.id));
        let _ = writeln!(out, "- title: {}", json(&phase.title));
        let _ = writeln!(out, "- kind: {}", phase.kind);
        let _ = writeln!(out, "- status: {}", phase.status);
        let _ = writeln!(out, "- depends_on: {}", json(&phase.depends_on));
        let _ = writeln!(out, "- context_files: {}", json(&phase.context_files));
        if let Some(commit) = &phase.git_commit {
            let _ = writeln!(out, "- git_commit: {}", json(commit));
        }
        if let Some(files) = &phase.modified_files {
            let _ = writeln!(out, "- modified_files: {}", json(files));
        }
        if let Some(hashes) = &phase.failure_hashes {
            let _ = writeln!(out, "- failure_hashes: {}", json(hashes));
        }
        out.push('\n');

        write_text(&mut out, "description", &phase.description);
        for (field, value) in [
            ("change_spec", &phase.change_spec),
            ("output", &phase.output),
            ("error", &phase.error),
        ] {
            if let Some(text) = value {
                write_text(&mut out, field, text);
            }
        }
    }
    out
}

#[derive(Default)]
struct PhaseFields {
    line: usize,
    id: Option<String>,
    title: Option<String>,
    kind: Option<PhaseKind>,
    status: Option<PhaseStatus>,
    depends_on: Option<Vec<String>>,
    context_files: Option<Vec<String>>,
    git_commit: Option<String>,
    modified_files: Option<Vec<String>>,
    failure_hashes: Option<BTreeMap<String, String>>,
    text: BTreeMap<String, String>,
}

impl PhaseFields {
    fn build(mut self) -> Result<PlanPhase, MarkdownError> {
        let id = self.id.ok_or(MarkdownError::MissingField {
            field: "id",
            phase: None,
        })?;
        let missing = |field: &'static str| MarkdownError::MissingField {
            field,
            phase: Some(id.clone()),
        };
        Ok(PlanPhase {
            title: self.title.ok_or_else(|| missing("title"))?,
            kind: self.kind.ok_or_else(|| missing("kind"))?,
            status: self.status.ok_or_else(|| missing("status"))?,
            description: self
                .text
                .remove("description")
                .ok_or_else(|| missing("description"))?,
            depends_on: self.depends_on.unwrap_or_default(),
            context_files: self.context_files.unwrap_or_default(),
            change_spec: self.text.remove("change_spec"),
            output: self.text.remove("output"),
            error: self.text.remove("error"),
            git_commit: self.git_commit,
            modified_files: self.modified_files,
            failure_hashes: self.failure_hashes,
            id,
        })
    }
}

fn decode<T: DeserializeOwned>(line: usize, key: &str, raw: &str) -> Result<T, MarkdownError> {
    serde_json::from_str(raw).map_err(|e| MarkdownError::Invalid {
        line,
        message: format!("invalid value for '{key}': {e}"),
    })
}

fn bullet(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("- ")?;
    let (key, value) = rest.split_once(':')?;
    Some((key.trim(), value.trim()))
}

/// Parse a rendering produced by [`render`].
pub fn parse(text: &str) -> Result<PlanPhases, MarkdownError> {
    let lines: Vec<&str> = text.split('\n').collect();
    let invalid = |line: usize, message: String| MarkdownError::Invalid {
        line: line + 1,
        message,
    };

    let mut plan_id: Option<String> = None;
    let mut plan_file: Option<String> = None;
    let mut plan_hash: Option<String> = None;
    let mut created_at: Option<DateTime<Utc>> = None;
    let mut updated_at: Option<DateTime<Utc>> = None;
    let mut phases: Vec<PlanPhase> = Vec::new();
    let mut current: Option<PhaseFields> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_end_matches('\r');

        if line.starts_with("## Phase ") {
            if let Some(fields) = current.take() {
                phases.push(fields.build()?);
            }
            current = Some(PhaseFields {
                line: i + 1,
                ..Default::default()
            });
        } else if let Some(field) = line.strip_prefix("### ") {
            let field = field.trim();
            let Some(fields) = current.as_mut() else {
                return Err(invalid(i, format!("text field '{field}' outside a phase")));
            };
            if !TEXT_FIELDS.contains(&field) {
                return Err(invalid(i, format!("unknown text field '{field}'")));
            }
            // Skip blank lines up to the opening fence
            let mut j = i + 1;
            while j < lines.len() && lines[j].trim().is_empty() {
                j += 1;
            }
            let fence = lines.get(j).map(|l| l.trim_end_matches('\r')).unwrap_or("");
            if fence.len() < 3 || !fence.chars().all(|c| c == '~') {
                return Err(invalid(j, format!("expected a tilde fence for '{field}'")));
            }
            let close = (j + 1..lines.len())
                .find(|&k| lines[k].trim_end_matches('\r') == fence)
                .ok_or_else(|| invalid(j, format!("unterminated fence for '{field}'")))?;
            fields
                .text
                .insert(field.to_string(), lines[j + 1..close].join("\n"));
            i = close;
        } else if let Some((key, value)) = bullet(line) {
            match current.as_mut() {
                None => match key {
                    "version" => {}
                    "plan_id" => plan_id = Some(decode(i + 1, key, value)?),
                    "plan_file" => plan_file = Some(decode(i + 1, key, value)?),
                    "plan_content_hash" => plan_hash = Some(decode(i + 1, key, value)?),
                    "created_at" => created_at = Some(decode(i + 1, key, value)?),
                    "updated_at" => updated_at = Some(decode(i + 1, key, value)?),
                    other => return Err(invalid(i, format!("unknown header field '{other}'"))),
                },
                Some(fields) => match key {
                    "id" => fields.id = Some(decode(i + 1, key, value)?),
                    "title" => fields.title = Some(decode(i + 1, key, value)?),
                    "kind" => {
                        fields.kind = Some(value.parse().map_err(|e| invalid(i, format!("{e}")))?)
                    }
                    "status" => {
                        fields.status = Some(value.parse().map_err(|e| invalid(i, format!("{e}")))?)
                    }
                    "depends_on" => fields.depends_on = Some(decode(i + 1, key, value)?),
                    "context_files" => fields.context_files = Some(decode(i + 1, key, value)?),
                    "git_commit" => fields.git_commit = Some(decode(i + 1, key, value)?),
                    "modified_files" => fields.modified_files = Some(decode(i + 1, key, value)?),
                    "failure_hashes" => fields.failure_hashes = Some(decode(i + 1, key, value)?),
                    other => {
                        return Err(invalid(
                            i,
                            format!("unknown field '{other}' in phase starting at line {}", fields.line),
                        ));
                    }
                },
            }
        }
        i += 1;
    }
    if let Some(fields) = current.take() {
        phases.push(fields.build()?);
    }

    let header = |field: &'static str| MarkdownError::MissingField { field, phase: None };
    Ok(PlanPhases {
        plan_id: plan_id.ok_or_else(|| header("plan_id"))?,
        plan_file: plan_file.ok_or_else(|| header("plan_file"))?,
        plan_content_hash: plan_hash.ok_or_else(|| header("plan_content_hash"))?,
        created_at: created_at.ok_or_else(|| header("created_at"))?,
        updated_at: updated_at.ok_or_else(|| header("updated_at"))?,
        phases,
    })
}
