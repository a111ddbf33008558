//! Retry guard for failed phases.
//!
//! Re-running a failed phase is only worthwhile when the failed attempt left
//! evidence of forward progress on disk: a non-empty modified-files list
//! and the content fingerprints captured at failure time. Known transient
//! infrastructure errors skip the check, and audit phases are never guarded
//! (they recover through the fix loop).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::phase::{PhaseKind, PhaseStatus, PlanPhase};

/// Error signatures that indicate an environment hiccup rather than a
/// reproducible task failure.
static TRANSIENT_ERRORS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("missing-session", r"(?i)no conversation found with session id"),
        ("missing-session", r"(?i)session (?:not found|expired)"),
        ("missing-state", r"(?i)state record (?:not found|missing)"),
        ("api-overloaded", r"(?i)overloaded_error|\b529\b"),
        ("connection-reset", r"(?i)econnreset|socket hang up|connection reset by peer"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).unwrap()))
    .collect()
});

/// Name of the transient signature matching `error`, if any.
pub fn transient_signature(error: &str) -> Option<&'static str> {
    TRANSIENT_ERRORS
        .iter()
        .find(|(_, re)| re.is_match(error))
        .map(|(name, _)| *name)
}

/// Why a retry was allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAllowance {
    /// The phase is not in a failed state
    NotFailed,
    /// Audit phases recover through the fix loop instead
    AuditPhase,
    /// The recorded error matches a known transient signature
    Transient(&'static str),
    /// The failed attempt recorded modified files and their fingerprints
    ProgressRecorded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Allow(RetryAllowance),
    Blocked { message: String },
}

impl RetryDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Decide whether `phase` may be retried automatically.
pub fn check_retry(phase: &PlanPhase) -> RetryDecision {
    if phase.status != PhaseStatus::Failed {
        return RetryDecision::Allow(RetryAllowance::NotFailed);
    }
    if phase.kind == PhaseKind::Audit {
        return RetryDecision::Allow(RetryAllowance::AuditPhase);
    }
    if let Some(signature) = phase.error.as_deref().and_then(transient_signature) {
        return RetryDecision::Allow(RetryAllowance::Transient(signature));
    }

    let has_files = phase.modified_files.as_ref().is_some_and(|f| !f.is_empty());
    let has_hashes = phase.failure_hashes.is_some();
    if has_files && has_hashes {
        return RetryDecision::Allow(RetryAllowance::ProgressRecorded);
    }

    let missing = match (has_files, has_hashes) {
        (false, false) => "modifiedFiles and failureHashes",
        (false, true) => "modifiedFiles",
        _ => "failureHashes",
    };
    RetryDecision::Blocked {
        message: format!(
            "Phase {} failed without recorded progress (no {}). Retrying would repeat the same failure; \
             skip the phase or regenerate phases from the plan. Last error: {}",
            phase.id,
            missing,
            phase.error.as_deref().unwrap_or("unknown")
        ),
    }
}

/// Whether a new failure left the same files with the same fingerprints as
/// the previous failure. Such an attempt recorded no progress of its own.
pub fn repeats_failure(
    previous: Option<&BTreeMap<String, String>>,
    current: Option<&BTreeMap<String, String>>,
) -> bool {
    matches!((previous, current), (Some(prev), Some(cur)) if prev == cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(kind: PhaseKind, error: &str) -> PlanPhase {
        let mut phase = PlanPhase::new("phase-02", "Implement", kind, "edit");
        phase.status = PhaseStatus::Failed;
        phase.error = Some(error.to_string());
        phase
    }

    #[test]
    fn test_failed_without_progress_is_blocked() {
        let decision = check_retry(&failed(PhaseKind::Implement, "compile error"));
        match decision {
            RetryDecision::Blocked { message } => {
                assert!(message.contains("modifiedFiles"));
                assert!(message.contains("phase-02"));
                assert!(message.contains("compile error"));
            }
            other => panic!("Expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_with_progress_is_allowed() {
        let mut phase = failed(PhaseKind::Implement, "timeout");
        phase.modified_files = Some(vec!["src/a.rs".into()]);
        phase.failure_hashes = Some(BTreeMap::from([("src/a.rs".into(), "abc".into())]));
        assert_eq!(
            check_retry(&phase),
            RetryDecision::Allow(RetryAllowance::ProgressRecorded)
        );
    }

    #[test]
    fn test_both_fields_are_required() {
        let mut phase = failed(PhaseKind::Implement, "timeout");
        phase.modified_files = Some(vec!["src/a.rs".into()]);
        assert!(check_retry(&phase).is_blocked());

        let mut phase = failed(PhaseKind::Implement, "timeout");
        phase.failure_hashes = Some(BTreeMap::new());
        phase.modified_files = Some(Vec::new());
        assert!(check_retry(&phase).is_blocked());
    }

    #[test]
    fn test_transient_errors_bypass_guard() {
        let phase = failed(
            PhaseKind::Implement,
            "Error: No conversation found with session ID: 1234",
        );
        assert_eq!(
            check_retry(&phase),
            RetryDecision::Allow(RetryAllowance::Transient("missing-session"))
        );
        assert_eq!(transient_signature("read ECONNRESET"), Some("connection-reset"));
        assert_eq!(transient_signature("syntax error"), None);
    }

    #[test]
    fn test_repeated_fingerprints_are_detected() {
        let first = BTreeMap::from([("src/a.rs".to_string(), "abc".to_string())]);
        let same = first.clone();
        let edited = BTreeMap::from([("src/a.rs".to_string(), "def".to_string())]);
        assert!(repeats_failure(Some(&first), Some(&same)));
        assert!(!repeats_failure(Some(&first), Some(&edited)));
        assert!(!repeats_failure(None, Some(&first)));
        assert!(!repeats_failure(Some(&first), None));
    }

    #[test]
    fn test_audit_phases_are_not_guarded() {
        let phase = failed(PhaseKind::Audit, "blocking findings");
        assert_eq!(
            check_retry(&phase),
            RetryDecision::Allow(RetryAllowance::AuditPhase)
        );
    }
}
