//! Candidate file extraction from a plan.
//!
//! Two sources, in priority order:
//! 1. A "Change Manifest" section holding a fenced JSON array of paths
//! 2. Backtick-wrapped paths in the Changes section (list items, headings,
//!    or bold/italic emphasis)

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::sections::MarkdownDoc;
use crate::paths::WORKSPACE_PREFIX;

static BACKTICK_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\n]+)`").unwrap());

static EMPHASIZED_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\*\*|__|\*|_)`([^`\n]+)`(\*\*|__|\*|_)").unwrap());

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)(?:[-*+]|\d+[.)])\s+").unwrap());

static CHANGES_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:\d+[.)]?\s*)?(?:proposed\s+|planned\s+|file\s+|code\s+)?changes\b").unwrap()
});

static MANIFEST_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:\d+[.)]?\s*)?change[\s-]+manifest\b").unwrap());

static PASCAL_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]*)*$").unwrap());

static ALL_CAPS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap());

/// Extensions accepted on bare filenames (no directory component).
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "swift", "rb", "php",
    "c", "h", "cc", "cpp", "hpp", "cs", "scala", "sh", "bash", "zsh", "sql", "md", "mdx", "txt",
    "json", "jsonc", "yaml", "yml", "toml", "ini", "cfg", "conf", "env", "html", "htm", "css",
    "scss", "sass", "less", "vue", "svelte", "xml", "proto", "graphql", "gql", "lock", "dart",
    "lua", "ex", "exs", "erl", "hs", "ml", "zig", "nix", "tf", "csv",
];

/// Filenames that are files despite having no extension.
const EXTENSIONLESS_FILES: &[&str] = &[
    "Makefile",
    "Dockerfile",
    "Justfile",
    "Rakefile",
    "Gemfile",
    "Procfile",
    "LICENSE",
    "CODEOWNERS",
];

/// Roots used to decide whether a bare filename belongs to the workspace.
#[derive(Debug, Clone, Default)]
pub struct FileRoots<'a> {
    pub project_root: Option<&'a Path>,
    pub workspace_root: Option<&'a Path>,
}

/// Whether a section title names the Changes section.
pub fn is_changes_title(title: &str) -> bool {
    CHANGES_TITLE.is_match(strip_inline_markup(title).trim())
}

/// Whether a section title names the Change Manifest section.
pub fn is_manifest_title(title: &str) -> bool {
    MANIFEST_TITLE.is_match(strip_inline_markup(title).trim())
}

fn strip_inline_markup(title: &str) -> String {
    title.replace(['*', '_', '`'], "")
}

/// Paths from a Change Manifest section, if the plan has a usable one.
///
/// The first fenced block in the section that parses as a JSON array of
/// strings wins. A manifest section without such a block is ignored.
pub fn manifest_files(doc: &MarkdownDoc<'_>) -> Option<Vec<String>> {
    let section = doc.find_section(is_manifest_title)?;
    doc.fenced_blocks(section.heading_line + 1, section.end)
        .into_iter()
        .find_map(|block| serde_json::from_str::<Vec<String>>(&block.content).ok())
        .map(|files| {
            files
                .into_iter()
                .map(|f| clean_reference(&f))
                .filter(|f| !f.is_empty())
                .collect()
        })
}

/// Paths mentioned in the Changes section.
pub fn heuristic_files(doc: &MarkdownDoc<'_>) -> Vec<String> {
    let Some(section) = doc.find_section(is_changes_title) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for index in section.heading_line + 1..section.end {
        if doc.is_fenced(index) {
            continue;
        }
        found.extend(line_references(doc.lines()[index]));
    }
    found
}

/// File references on one line of the Changes section.
///
/// Headings and list items contribute every path-like backtick span; prose
/// only contributes spans wrapped in emphasis.
pub fn line_references(line: &str) -> Vec<String> {
    let structural = super::sections::parse_heading(line).is_some() || LIST_ITEM.is_match(line);
    let spans: Vec<&str> = if structural {
        BACKTICK_SPAN
            .captures_iter(line)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    } else {
        EMPHASIZED_SPAN
            .captures_iter(line)
            .filter(|c| c.get(1).map(|m| m.as_str()) == c.get(3).map(|m| m.as_str()))
            .filter_map(|c| c.get(2).map(|m| m.as_str()))
            .collect()
    };

    spans
        .into_iter()
        .map(clean_reference)
        .filter(|s| looks_like_path(s))
        .collect()
}

fn clean_reference(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}

/// Whether a backtick span plausibly names a file.
pub fn looks_like_path(span: &str) -> bool {
    if span.is_empty() || span.len() > 260 {
        return false;
    }
    if span.starts_with(['\'', '"', '-', '@', '$', '/']) || span.contains("://") {
        return false;
    }
    if span.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '(' | ')' | '<' | '>' | '{' | '}' | '[' | ']' | '=' | ',' | ';' | ':' | '*' | '?' | '|' | '&' | '!'
            )
    }) {
        return false;
    }
    if span.ends_with('/') || span.split('/').any(|seg| seg.is_empty()) {
        return false;
    }

    let name = span.rsplit('/').next().unwrap_or(span);
    if EXTENSIONLESS_FILES.contains(&name) {
        return true;
    }
    let extension = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() || name.starts_with('.') => ext,
        _ => return false,
    };
    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }

    if !span.contains('/') {
        // Bare identifiers such as `Config.load` or `MAX_SIZE` are not files
        if PASCAL_CASE.is_match(span) || ALL_CAPS.is_match(span) {
            return false;
        }
        let stem = &name[..name.len() - extension.len() - 1];
        if PASCAL_CASE.is_match(stem) && !SOURCE_EXTENSIONS.contains(&extension) {
            return false;
        }
        return SOURCE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str());
    }
    extension.len() <= 10
}

/// Prefix bare filenames that only exist under the workspace root.
pub fn normalize_entry(file: &str, roots: &FileRoots<'_>) -> String {
    if file.contains('/') || file.starts_with(WORKSPACE_PREFIX) {
        return file.to_string();
    }
    let (Some(project), Some(workspace)) = (roots.project_root, roots.workspace_root) else {
        return file.to_string();
    };
    if workspace.join(file).exists() && !project.join(file).exists() {
        format!("{WORKSPACE_PREFIX}{file}")
    } else {
        file.to_string()
    }
}

/// Candidate files for a plan: the manifest if present, otherwise the
/// heuristic scan; normalized and deduplicated in first-seen order.
pub fn candidate_files(doc: &MarkdownDoc<'_>, roots: &FileRoots<'_>) -> Vec<String> {
    let raw = manifest_files(doc).unwrap_or_else(|| heuristic_files(doc));
    let mut seen = HashSet::new();
    raw.iter()
        .map(|f| normalize_entry(f, roots))
        .filter(|f| seen.insert(f.clone()))
        .collect()
}
