//! Prompt construction for phase, fix, and re-audit invocations.

use std::fs;

use tracing::{debug, warn};

use crate::audit::verdict::AuditFinding;
use crate::paths::PathResolver;
use crate::phase::{PhaseKind, PlanPhase};

/// A context file inlined into the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFile {
    pub entry: String,
    pub content: String,
    pub truncated: bool,
}

const NARRATION: &str = "Narrate your progress as you work: before each significant step, say in one short sentence what you are about to do.";

/// Read the phase's context files into memory, up to `max_bytes` total.
///
/// Entries outside the permitted roots are skipped with a warning; files
/// that do not exist yet are skipped silently.
pub fn inject_context_files(resolver: &PathResolver, entries: &[String], max_bytes: usize) -> Vec<InjectedFile> {
    let mut remaining = max_bytes;
    let mut injected = Vec::new();

    for entry in entries {
        if remaining == 0 {
            break;
        }
        let path = match resolver.resolve(entry) {
            Ok(path) => path,
            Err(e) => {
                warn!(entry = %entry, error = %e, "Skipping context file");
                continue;
            }
        };
        let Ok(content) = fs::read_to_string(&path) else {
            debug!(entry = %entry, "Context file not readable; skipping");
            continue;
        };
        let truncated = content.len() > remaining;
        let content = if truncated {
            content[..content.floor_char_boundary(remaining)].to_string()
        } else {
            content
        };
        remaining -= content.len();
        injected.push(InjectedFile {
            entry: entry.clone(),
            content,
            truncated,
        });
    }
    injected
}

fn injected_section(injected: &[InjectedFile]) -> String {
    if injected.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Pre-read files\n");
    for file in injected {
        let fence = "`".repeat(longest_backtick_run(&file.content).max(2) + 1);
        out.push_str(&format!("\n### {}\n{}\n{}\n{}\n", file.entry, fence, file.content, fence));
        if file.truncated {
            out.push_str("(truncated)\n");
        }
    }
    out
}

fn longest_backtick_run(text: &str) -> usize {
    text.split(|c| c != '`').map(str::len).max().unwrap_or(0)
}

fn file_list(files: &[String]) -> String {
    if files.is_empty() {
        return "(none declared)".to_string();
    }
    files.iter().map(|f| format!("- {}", f)).collect::<Vec<_>>().join("\n")
}

/// Build the prompt for one phase.
pub fn build_phase_prompt(phase: &PlanPhase, objective: &str, injected: &[InjectedFile]) -> String {
    let framing = match phase.kind {
        PhaseKind::Read => r#"This is a READ phase. Use only read and search tools (Read, Glob, Grep).
Do not create, edit, or delete any file. Build an accurate picture of the code the plan touches
and finish with a concise summary of what you learned that later phases need."#
            .to_string(),
        PhaseKind::Implement => format!(
            r#"This is an IMPLEMENT phase. You may create, edit, and delete files and run commands.
Make exactly the changes described below, limited to the listed files unless the change
cannot be completed otherwise. Do not modify planning documents.

## Change specification
{}

Finish with a short summary of the edits you made."#,
            phase
                .change_spec
                .as_deref()
                .unwrap_or("Implement the plan as described by the objective.")
        ),
        PhaseKind::Audit => r#"This is an AUDIT phase. Compare the actual working tree against the plan.
Check every change the plan requires, run the project's checks if available, and report each
finding on its own line prefixed with a severity marker:
- [blocking] the plan is not satisfied or the code is broken
- [medium] a real problem that does not break the plan
- [minor] small defects or omissions
- [suggestion] optional improvements
If everything matches the plan, say so without writing any severity marker. Do not fix anything yourself."#
            .to_string(),
    };

    format!(
        r#"# Phase {id}: {title}

## Objective
{objective}

## Phase description
{description}

## Context files
{files}
{injected}
## Instructions
{framing}

{narration}
"#,
        id = phase.id,
        title = phase.title,
        objective = objective.trim(),
        description = phase.description,
        files = file_list(&phase.context_files),
        injected = injected_section(injected),
        framing = framing,
        narration = NARRATION,
    )
}

/// Inputs for a fix attempt prompt.
#[derive(Debug, Clone)]
pub struct FixPromptInput<'a> {
    pub objective: &'a str,
    pub findings: &'a [&'a AuditFinding],
    pub modified_files: &'a [String],
    pub context_files: &'a [String],
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Build the prompt for one fix attempt.
pub fn build_fix_prompt(input: &FixPromptInput<'_>) -> String {
    let findings = if input.findings.is_empty() {
        "(the audit reported a failing verdict without itemized findings)".to_string()
    } else {
        input
            .findings
            .iter()
            .map(|f| format!("- [{}] {}", f.severity, f.text))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let urgency = if input.attempt >= input.max_attempts {
        "\nThis is the FINAL attempt. If the blocking findings are not resolved now, every change \
made since the audit will be rolled back. Fix the blocking findings first and nothing else.\n"
    } else {
        ""
    };

    format!(
        r#"# Fix attempt {attempt}/{max}

## Objective
{objective}

## Audit findings to resolve
{findings}

## Files modified so far
{modified}

## Scope
{scope}
{urgency}
## Instructions
You can read, write, edit, and search files. You cannot run shell commands.
Resolve the findings above with the smallest correct change. Do not touch planning documents.

{narration}
"#,
        attempt = input.attempt,
        max = input.max_attempts,
        objective = input.objective.trim(),
        findings = findings,
        modified = file_list(input.modified_files),
        scope = file_list(input.context_files),
        urgency = urgency,
        narration = NARRATION,
    )
}
