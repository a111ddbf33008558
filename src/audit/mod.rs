//! Audit grading and the automatic fix loop.

pub mod fix_loop;
pub mod verdict;

pub use fix_loop::{FixContext, FixLoop, FixLoopOutcome};
pub use verdict::{AuditFinding, AuditVerdict, Severity};
