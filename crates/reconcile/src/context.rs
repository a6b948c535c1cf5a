//! Progress and confirmation callbacks
//!
//! These traits keep the reconciliation core free of any terminal UI.

use crate::plan::{PlanSummary, PlannedOp};
use crate::types::OpOutcome;

/// Progress callback for reconciliation runs
pub trait ProgressCallback {
    /// Called once a group's plan is known, before anything is applied
    fn on_plan(&mut self, group: &str, summary: &PlanSummary);

    /// Called before an operation is sent
    fn on_op_start(&mut self, group: &str, op: &PlannedOp);

    /// Called after an operation succeeded
    fn on_op_complete(&mut self, group: &str, op: &PlannedOp, outcome: &OpOutcome);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback {
    /// Ask the user to confirm an action
    ///
    /// # Returns
    /// `true` if the user confirmed, `false` otherwise
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_plan(&mut self, _group: &str, _summary: &PlanSummary) {}
    fn on_op_start(&mut self, _group: &str, _op: &PlannedOp) {}
    fn on_op_complete(&mut self, _group: &str, _op: &PlannedOp, _outcome: &OpOutcome) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(false)
    }
}
