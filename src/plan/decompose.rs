//! Plan text → phase graph.
//!
//! With no candidate files the plan gets a fixed read → implement → audit
//! skeleton. Otherwise files are grouped into batches (module with its test,
//! directory proximity, size cap) and each batch becomes one implement
//! phase, followed by a single audit phase that depends on all of them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::files::{FileRoots, candidate_files, is_changes_title, line_references};
use super::sections::{MarkdownDoc, parse_heading};
use super::content_hash;
use crate::errors::DecomposeError;
use crate::paths::WORKSPACE_PREFIX;
use crate::phase::{PhaseKind, PlanPhase, PlanPhases};

pub const DEFAULT_MAX_FILES_PER_PHASE: usize = 4;

/// Knobs for [`decompose`].
#[derive(Debug, Clone)]
pub struct DecomposeOptions {
    pub max_files_per_phase: usize,
    pub project_root: Option<PathBuf>,
    pub workspace_root: Option<PathBuf>,
}

impl Default for DecomposeOptions {
    fn default() -> Self {
        Self {
            max_files_per_phase: DEFAULT_MAX_FILES_PER_PHASE,
            project_root: None,
            workspace_root: None,
        }
    }
}

impl DecomposeOptions {
    pub fn with_max_files_per_phase(mut self, max: usize) -> Self {
        self.max_files_per_phase = max;
        self
    }

    pub fn with_roots(mut self, project_root: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(project_root.into());
        self.workspace_root = Some(workspace_root.into());
        self
    }
}

fn phase_id(n: usize) -> String {
    format!("phase-{:02}", n)
}

/// Decompose plan text into a validated phase aggregate.
pub fn decompose(
    plan_id: &str,
    plan_file: &str,
    plan_text: &str,
    options: &DecomposeOptions,
) -> Result<PlanPhases, DecomposeError> {
    let doc = MarkdownDoc::parse(plan_text);
    let roots = FileRoots {
        project_root: options.project_root.as_deref(),
        workspace_root: options.workspace_root.as_deref(),
    };
    let files = candidate_files(&doc, &roots);

    let phases = if files.is_empty() {
        debug!(plan_id, "No candidate files found; using skeleton decomposition");
        skeleton_phases(&doc, plan_file)
    } else {
        let batches = batch_files(&files, options.max_files_per_phase.max(1));
        debug!(plan_id, files = files.len(), batches = batches.len(), "Decomposed plan into batches");
        batched_phases(&doc, plan_file, batches)
    };

    let aggregate = PlanPhases::new(plan_id, plan_file, &content_hash(plan_text), phases);
    aggregate.validate()?;
    Ok(aggregate)
}

fn skeleton_phases(doc: &MarkdownDoc<'_>, plan_file: &str) -> Vec<PlanPhase> {
    let read = PlanPhase::new(
        &phase_id(1),
        "Read the plan",
        PhaseKind::Read,
        "Read the plan and the code it touches. Make no changes.",
    )
    .with_context_files(vec![plan_file.to_string()]);

    let mut implement = PlanPhase::new(
        &phase_id(2),
        "Implement the plan",
        PhaseKind::Implement,
        "Carry out every change the plan describes.",
    )
    .with_depends_on(vec![read.id.clone()]);
    if let Some(section) = doc.find_section(is_changes_title) {
        implement = implement.with_change_spec(doc.section_text(section));
    }

    let audit = PlanPhase::new(
        &phase_id(3),
        "Audit the implementation",
        PhaseKind::Audit,
        "Compare the working tree against the plan and report findings by severity.",
    )
    .with_depends_on(vec![implement.id.clone()])
    .with_context_files(vec![plan_file.to_string()]);

    vec![read, implement, audit]
}

fn batched_phases(doc: &MarkdownDoc<'_>, plan_file: &str, batches: Vec<Vec<String>>) -> Vec<PlanPhase> {
    let mut phases = Vec::with_capacity(batches.len() + 1);
    let mut audit_files: Vec<String> = Vec::new();

    for (i, batch) in batches.into_iter().enumerate() {
        let names: Vec<&str> = batch.iter().map(|f| file_name(f)).collect();
        let listed = batch
            .iter()
            .map(|f| format!("`{}`", f))
            .collect::<Vec<_>>()
            .join(", ");
        for file in &batch {
            if !audit_files.contains(file) {
                audit_files.push(file.clone());
            }
        }
        phases.push(
            PlanPhase::new(
                &phase_id(i + 1),
                &format!("Implement {}", names.join(", ")),
                PhaseKind::Implement,
                &format!("Apply the planned changes to {}.", listed),
            )
            .with_change_spec(change_spec_for(doc, &batch))
            .with_context_files(batch),
        );
    }

    let depends_on: Vec<String> = phases.iter().map(|p| p.id.clone()).collect();
    let mut context = vec![plan_file.to_string()];
    context.extend(audit_files.into_iter().filter(|f| f != plan_file));
    phases.push(
        PlanPhase::new(
            &phase_id(depends_on.len() + 1),
            "Audit the implementation",
            PhaseKind::Audit,
            "Compare the working tree against the plan and report findings by severity.",
        )
        .with_depends_on(depends_on)
        .with_context_files(context),
    );
    phases
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_dir(path: &str) -> &str {
    let path = path.strip_prefix(WORKSPACE_PREFIX).unwrap_or(path);
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn is_test_file(path: &str) -> bool {
    let name = file_name(path);
    let stem = name.split('.').next().unwrap_or(name);
    name.contains(".test.")
        || name.contains(".spec.")
        || stem.ends_with("_test")
        || stem.ends_with("_spec")
        || stem.starts_with("test_")
        || path.split('/').any(|seg| seg == "__tests__")
}

/// Key shared by a module and its test file (`src/auth.ts` and
/// `src/auth.test.ts` both map to `auth`).
fn subject_key(path: &str) -> String {
    let name = file_name(path);
    let stem = name.split('.').next().unwrap_or(name);
    let stem = stem
        .strip_suffix("_test")
        .or_else(|| stem.strip_suffix("_spec"))
        .unwrap_or(stem);
    let stem = stem.strip_prefix("test_").unwrap_or(stem);
    stem.to_lowercase()
}

/// A module plus (optionally) its test; never split across batches unless
/// the cap is smaller than the pair.
#[derive(Debug)]
struct Unit {
    files: Vec<String>,
    dir: String,
}

fn build_units(files: &[String]) -> Vec<Unit> {
    let mut units: Vec<Unit> = Vec::new();
    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();

    for file in files.iter().filter(|f| !is_test_file(f)) {
        by_key.entry(subject_key(file)).or_default().push(units.len());
        units.push(Unit {
            files: vec![file.clone()],
            dir: parent_dir(file).to_string(),
        });
    }

    for test in files.iter().filter(|f| is_test_file(f)) {
        let candidates = by_key.get(&subject_key(test)).cloned().unwrap_or_default();
        let open: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| units[i].files.len() == 1)
            .collect();
        // Prefer the module in the closest directory
        let target = open
            .iter()
            .copied()
            .max_by_key(|&i| (shared_depth(&units[i].dir, parent_dir(test)), std::cmp::Reverse(i)));
        match target {
            Some(i) => units[i].files.push(test.clone()),
            None => units.push(Unit {
                files: vec![test.clone()],
                dir: parent_dir(test).to_string(),
            }),
        }
    }

    // Keep first-mention order for units regardless of test position
    let position: HashMap<&str, usize> = files.iter().enumerate().map(|(i, f)| (f.as_str(), i)).collect();
    units.sort_by_key(|u| u.files.iter().filter_map(|f| position.get(f.as_str())).min().copied());
    units
}

fn shared_depth(a: &str, b: &str) -> usize {
    Path::new(a)
        .components()
        .zip(Path::new(b).components())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Directories are near when equal or siblings under the same parent.
fn dirs_near(a: &str, b: &str) -> bool {
    a == b || (!a.is_empty() && !b.is_empty() && parent_dir(a) == parent_dir(b))
}

/// Group files into batches of at most `cap` files.
fn batch_files(files: &[String], cap: usize) -> Vec<Vec<String>> {
    let mut units = build_units(files);

    // Cluster by directory in order of first appearance
    let mut dir_order: Vec<String> = Vec::new();
    for unit in &units {
        if !dir_order.contains(&unit.dir) {
            dir_order.push(unit.dir.clone());
        }
    }
    let mut clustered: Vec<Unit> = Vec::with_capacity(units.len());
    for dir in &dir_order {
        let (same, rest): (Vec<Unit>, Vec<Unit>) = units.into_iter().partition(|u| &u.dir == dir);
        clustered.extend(same);
        units = rest;
    }

    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_dir: Option<String> = None;

    for unit in clustered {
        let pieces: Vec<Vec<String>> = if unit.files.len() > cap {
            unit.files.into_iter().map(|f| vec![f]).collect()
        } else {
            vec![unit.files]
        };
        for piece in pieces {
            let fits = current.len() + piece.len() <= cap;
            let near = current_dir.as_deref().is_none_or(|d| dirs_near(d, &unit.dir));
            if !current.is_empty() && (!fits || !near) {
                batches.push(std::mem::take(&mut current));
            }
            if current.is_empty() {
                current_dir = Some(unit.dir.clone());
            }
            current.extend(piece);
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// The Changes-section text describing `batch`, with a fallback note for
/// files the plan never describes.
fn change_spec_for(doc: &MarkdownDoc<'_>, batch: &[String]) -> String {
    let mut snippets: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for file in batch {
        match describe_file(doc, file) {
            Some(snippet) => {
                if seen.insert(snippet.clone()) {
                    snippets.push(snippet);
                }
            }
            None => snippets.push(format!(
                "- `{}`: no dedicated entry in the plan's Changes section. Apply whatever the plan implies for this file.",
                file
            )),
        }
    }
    snippets.join("\n\n")
}

fn mentions(line: &str, file: &str) -> bool {
    let bare = file.strip_prefix(WORKSPACE_PREFIX).unwrap_or(file);
    line_references(line).iter().any(|r| r == file || r == bare)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_list_item(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || trimmed.starts_with("+ ")
        || trimmed
            .split_once(['.', ')'])
            .is_some_and(|(n, rest)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) && rest.starts_with(' '))
}

/// The heading subsection or list item in the Changes section that
/// mentions `file`.
fn describe_file(doc: &MarkdownDoc<'_>, file: &str) -> Option<String> {
    let section = doc.find_section(is_changes_title)?;
    let lines = doc.lines();
    let start = section.heading_line + 1;

    for index in start..section.end {
        if doc.is_fenced(index) || !mentions(lines[index], file) {
            continue;
        }
        if let Some((level, _)) = parse_heading(lines[index]) {
            let end = (index + 1..section.end)
                .find(|&i| !doc.is_fenced(i) && parse_heading(lines[i]).is_some_and(|(l, _)| l <= level))
                .unwrap_or(section.end);
            return Some(doc.join_lines(index, end).trim_end().to_string());
        }
        if is_list_item(lines[index]) {
            let indent = indent_of(lines[index]);
            let mut end = index + 1;
            while end < section.end {
                let line = lines[end];
                if line.trim().is_empty() {
                    // A blank line only continues the item if indented text follows
                    let resumes = lines[end + 1..section.end]
                        .iter()
                        .find(|l| !l.trim().is_empty())
                        .is_some_and(|l| indent_of(l) > indent);
                    if !resumes {
                        break;
                    }
                } else if (!doc.is_fenced(end) && parse_heading(line).is_some())
                    || (indent_of(line) <= indent && !doc.is_fenced(end))
                {
                    break;
                }
                end += 1;
            }
            return Some(doc.join_lines(index, end).trim_end().to_string());
        }
        // Emphasized mention in prose: take the paragraph
        let begin = (start..index)
            .rev()
            .find(|&i| lines[i].trim().is_empty() || parse_heading(lines[i]).is_some())
            .map_or(start, |i| i + 1);
        let end = (index + 1..section.end)
            .find(|&i| lines[i].trim().is_empty() || parse_heading(lines[i]).is_some())
            .unwrap_or(section.end);
        return Some(doc.join_lines(begin, end).trim_end().to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseStatus;

    const PLAN_FILE: &str = "workspace/plans/feature.md";

    fn run(plan: &str) -> PlanPhases {
        decompose("feature", PLAN_FILE, plan, &DecomposeOptions::default()).unwrap()
    }

    const BATCHED_PLAN: &str = "# Feature\n\
\n\
## Objective\n\
Add rate limiting.\n\
\n\
## Changes\n\
\n\
### `src/api/limits.ts`\n\
Define the limiter.\n\
\n\
### `src/api/routes.ts`\n\
Wire the limiter into routes.\n\
\n\
- `src/auth/session.ts`: extend the session with a counter\n\
  keep the old fields\n\
- `src/auth/session.test.ts`: cover the counter\n\
\n\
## Risks\n\
None.\n";

    #[test]
    fn test_skeleton_when_no_files() {
        let phases = run("# Plan\n## Objective\nThink hard.\n## Changes\nRefactor everything.\n");
        assert_eq!(phases.phases.len(), 3);
        let kinds: Vec<PhaseKind> = phases.phases.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![PhaseKind::Read, PhaseKind::Implement, PhaseKind::Audit]);

        let implement = &phases.phases[1];
        assert!(implement.context_files.is_empty());
        let audit = &phases.phases[2];
        assert_eq!(audit.depends_on, vec!["phase-02"]);
        assert_eq!(audit.context_files, vec![PLAN_FILE]);
        assert!(phases.phases.iter().all(|p| p.status == PhaseStatus::Pending));
    }

    #[test]
    fn test_batched_decomposition() {
        let phases = run(BATCHED_PLAN);
        let implement: Vec<&PlanPhase> = phases
            .phases
            .iter()
            .filter(|p| p.kind == PhaseKind::Implement)
            .collect();
        assert!(!implement.is_empty());
        for phase in &implement {
            assert!(phase.context_files.len() <= DEFAULT_MAX_FILES_PER_PHASE);
        }

        // Module and test land in the same batch
        let with_session = implement
            .iter()
            .find(|p| p.context_files.contains(&"src/auth/session.ts".to_string()))
            .unwrap();
        assert!(with_session
            .context_files
            .contains(&"src/auth/session.test.ts".to_string()));

        let audits: Vec<&PlanPhase> = phases
            .phases
            .iter()
            .filter(|p| p.kind == PhaseKind::Audit)
            .collect();
        assert_eq!(audits.len(), 1);
        let audit = audits[0];
        assert_eq!(phases.phases.last().unwrap().id, audit.id);
        for phase in &implement {
            assert!(audit.depends_on.contains(&phase.id));
            for file in &phase.context_files {
                assert!(audit.context_files.contains(file));
            }
        }
    }

    #[test]
    fn test_decomposition_is_deterministic() {
        let a = run(BATCHED_PLAN);
        let b = run(BATCHED_PLAN);
        assert_eq!(a.phases, b.phases);
        assert_eq!(a.plan_content_hash, b.plan_content_hash);
    }

    #[test]
    fn test_cap_is_respected() {
        let plan = "## Changes\n- `src/a.rs`\n- `src/b.rs`\n- `src/c.rs`\n";
        let opts = DecomposeOptions::default().with_max_files_per_phase(2);
        let phases = decompose("p", PLAN_FILE, plan, &opts).unwrap();
        let sizes: Vec<usize> = phases
            .phases
            .iter()
            .filter(|p| p.kind == PhaseKind::Implement)
            .map(|p| p.context_files.len())
            .collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(phases.phases.last().unwrap().depends_on, vec!["phase-01", "phase-02"]);
    }

    #[test]
    fn test_distant_directories_split() {
        let plan = "## Changes\n- `frontend/ui/button.tsx`\n- `backend/db/pool.rs`\n";
        let phases = run(plan);
        assert_eq!(
            phases.phases.iter().filter(|p| p.kind == PhaseKind::Implement).count(),
            2
        );
    }

    #[test]
    fn test_change_spec_is_file_specific() {
        let opts = DecomposeOptions::default().with_max_files_per_phase(2);
        let phases = decompose("feature", PLAN_FILE, BATCHED_PLAN, &opts).unwrap();
        let limits = phases
            .phases
            .iter()
            .find(|p| p.context_files.contains(&"src/api/limits.ts".to_string()))
            .unwrap();
        let spec = limits.change_spec.as_deref().unwrap();
        assert!(spec.contains("Define the limiter."));

        let session = phases
            .phases
            .iter()
            .find(|p| p.context_files.contains(&"src/auth/session.ts".to_string()))
            .unwrap();
        let spec = session.change_spec.as_deref().unwrap();
        assert!(spec.contains("extend the session with a counter"));
        assert!(spec.contains("keep the old fields"));
        assert!(!spec.contains("Define the limiter."));
    }

    #[test]
    fn test_manifest_files_get_fallback_note() {
        let plan = "## Change Manifest\n```json\n[\"src/undocumented.rs\"]\n```\n";
        let phases = run(plan);
        let spec = phases.phases[0].change_spec.as_deref().unwrap();
        assert!(spec.contains("src/undocumented.rs"));
        assert!(spec.contains("no dedicated entry"));
    }

    #[test]
    fn test_test_file_pairing_keys() {
        assert!(is_test_file("src/auth.test.ts"));
        assert!(is_test_file("tests/test_auth.py"));
        assert!(is_test_file("pkg/auth_test.go"));
        assert!(!is_test_file("src/testing.rs"));
        assert_eq!(subject_key("src/auth.test.ts"), subject_key("src/auth.ts"));
        assert_eq!(subject_key("tests/test_auth.py"), subject_key("auth.py"));
    }

    #[test]
    fn test_hash_recorded() {
        let phases = run(BATCHED_PLAN);
        assert_eq!(phases.plan_content_hash, content_hash(BATCHED_PLAN));
        assert_eq!(phases.plan_file, PLAN_FILE);
    }
}
