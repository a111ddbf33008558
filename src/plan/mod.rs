//! Plan parsing and decomposition.
//!
//! A plan is a markdown document with (at least) an Objective and a Changes
//! section. This module turns one into an ordered, dependency-annotated
//! phase list; see [`decompose::decompose`].

pub mod decompose;
pub mod files;
pub mod sections;

use sha2::{Digest, Sha256};
use std::path::Path;

pub use decompose::{DecomposeOptions, decompose};
pub use sections::MarkdownDoc;

/// Deterministic fingerprint of plan content (full SHA-256, lowercase hex).
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Convert a title to a filesystem-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Stable plan id derived from the plan file name.
pub fn plan_id_for(plan_file: &Path) -> String {
    let stem = plan_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let slug = slugify(&stem, 80);
    if slug.is_empty() {
        format!("plan-{}", &content_hash(plan_file.to_string_lossy().as_bytes())[..12])
    } else {
        slug
    }
}

/// The plan's stated objective.
///
/// Uses the Objective (or Goal) section when present; otherwise the text
/// before the first heading, then the first heading's title.
pub fn objective(plan_text: &str) -> String {
    let doc = MarkdownDoc::parse(plan_text);
    if let Some(section) = doc.find_section(|t| {
        let lower = t.to_lowercase();
        lower.contains("objective") || lower == "goal" || lower == "goals"
    }) {
        let body = doc.section_body(section);
        if !body.is_empty() {
            return body;
        }
    }
    let preamble = doc.preamble();
    if !preamble.is_empty() {
        return preamble;
    }
    doc.sections()
        .first()
        .map(|s| s.title.clone())
        .unwrap_or_default()
}
