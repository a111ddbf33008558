//! Severity grading of audit output.
//!
//! Audit agents tag each finding with a severity marker such as
//! `[blocking]`, `(minor)`, `**medium**`, or `severity: suggestion`. The
//! verdict is the highest severity found; it loops (triggers the fix loop)
//! only at or above the configured threshold.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Ordered severity scale, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Suggestion = 0,
    Minor = 1,
    Medium = 2,
    Blocking = 3,
}

/// Severity at which an audit verdict fails and the fix loop engages.
pub const DEFAULT_LOOP_THRESHOLD: Severity = Severity::Blocking;

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Suggestion, Self::Minor, Self::Medium, Self::Blocking];

    /// Numeric rank; higher is more severe.
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suggestion => "suggestion",
            Self::Minor => "minor",
            Self::Medium => "medium",
            Self::Blocking => "blocking",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Suggestion => "💡",
            Self::Minor => "🔹",
            Self::Medium => "⚠️",
            Self::Blocking => "❌",
        }
    }

    /// Map a marker word (including common aliases) to a severity.
    ///
    /// # Examples
    ///
    /// ```
    /// use phaser::audit::verdict::Severity;
    ///
    /// assert_eq!(Severity::from_marker("Critical"), Some(Severity::Blocking));
    /// assert_eq!(Severity::from_marker("nit"), Some(Severity::Suggestion));
    /// assert_eq!(Severity::from_marker("urgent"), None);
    /// ```
    pub fn from_marker(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "blocking" | "blocker" | "critical" => Some(Self::Blocking),
            "medium" | "major" | "moderate" => Some(Self::Medium),
            "minor" | "low" => Some(Self::Minor),
            "suggestion" | "nit" | "nitpick" | "info" => Some(Self::Suggestion),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suggestion" => Ok(Self::Suggestion),
            "minor" => Ok(Self::Minor),
            "medium" => Ok(Self::Medium),
            "blocking" => Ok(Self::Blocking),
            _ => anyhow::bail!(
                "Invalid severity '{}'. Valid values: suggestion, minor, medium, blocking",
                s
            ),
        }
    }
}

const MARKER_WORDS: &str = "blocking|blocker|critical|medium|major|moderate|minor|low|suggestion|nitpick|nit|info";

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\[\s*({w})\s*\]|\(\s*({w})\s*\)|\*\*\s*({w})\s*:?\s*\*\*|\bseverity\s*[:=]\s*\**\s*({w})\b",
        w = MARKER_WORDS
    ))
    .unwrap()
});

/// One graded line of audit output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub severity: Severity,
    pub text: String,
}

/// Outcome of grading an audit run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerdict {
    /// Highest severity found; `None` means clean
    pub max_severity: Option<Severity>,
    pub should_loop: bool,
    pub findings: Vec<AuditFinding>,
}

impl AuditVerdict {
    pub fn clean() -> Self {
        Self {
            max_severity: None,
            should_loop: false,
            findings: Vec::new(),
        }
    }

    /// Grade audit output against `threshold`.
    pub fn from_output(output: &str, threshold: Severity) -> Self {
        let findings: Vec<AuditFinding> = output
            .lines()
            .filter_map(|line| {
                let severity = line_severity(line)?;
                Some(AuditFinding {
                    severity,
                    text: clean_line(line),
                })
            })
            .collect();
        let max_severity = findings.iter().map(|f| f.severity).max();
        Self {
            should_loop: max_severity.is_some_and(|s| s >= threshold),
            max_severity,
            findings,
        }
    }

    /// Findings at or above `min`, most severe first.
    pub fn findings_at_least(&self, min: Severity) -> Vec<&AuditFinding> {
        let mut found: Vec<&AuditFinding> = self.findings.iter().filter(|f| f.severity >= min).collect();
        found.sort_by(|a, b| b.severity.cmp(&a.severity));
        found
    }

    /// One-line description for status output and phase error fields.
    pub fn summary(&self) -> String {
        let Some(max) = self.max_severity else {
            return "Audit clean: no findings".to_string();
        };
        let counts: Vec<String> = Severity::ALL
            .iter()
            .rev()
            .filter_map(|s| {
                let n = self.findings.iter().filter(|f| f.severity == *s).count();
                (n > 0).then(|| format!("{} {}", n, s))
            })
            .collect();
        format!("Audit max severity {}: {}", max, counts.join(", "))
    }
}

/// Words that, shortly before a marker, say the severity is absent.
const NEGATIONS: &[&str] = &["no", "not", "zero", "without", "none", "never"];

/// Words that, right after a marker, report an empty count.
const EMPTY_COUNTS: &[&str] = &["none", "0", "n/a", "nothing"];

/// "No [blocking] issues remain" or "[blocking]: none" grade nothing.
fn is_negated(before: &str, after: &str) -> bool {
    let preceded = before
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .rev()
        .take(3)
        .any(|w| NEGATIONS.contains(&w.to_lowercase().as_str()));
    let first_after = after
        .trim_start_matches(|c: char| c == ':' || c == '=' || c == '-' || c.is_whitespace())
        .split_whitespace()
        .next()
        .map(|w| w.trim_end_matches(['.', ',', ';']).to_lowercase());
    preceded || first_after.is_some_and(|w| EMPTY_COUNTS.contains(&w.as_str()))
}

fn line_severity(line: &str) -> Option<Severity> {
    MARKER
        .captures_iter(line)
        .filter(|caps| {
            caps.get(0)
                .is_some_and(|m| !is_negated(&line[..m.start()], &line[m.end()..]))
        })
        .filter_map(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .next()
                .and_then(|m| Severity::from_marker(m.as_str()))
        })
        .max()
}

fn clean_line(line: &str) -> String {
    let trimmed = line.trim();
    let trimmed = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .unwrap_or(trimmed);
    trimmed.trim().to_string()
}
