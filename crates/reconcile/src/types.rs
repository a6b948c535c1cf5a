//! Outcome types for applied operations.

use serde::{Deserialize, Serialize};

/// Result of applying one membership operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpOutcome {
    /// Member was removed
    Removed,
    /// Existing member's role was changed
    RoleChanged,
    /// Member was added
    Inserted,
    /// Member already existed and was rewritten
    Updated,
    /// Nothing was sent
    Skipped { reason: String },
}

impl OpOutcome {
    /// Check if the outcome represents a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Skipped { .. })
    }
}

/// Summary of a reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub removed: usize,
    pub role_changed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl ReconcileSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.removed + self.role_changed + self.inserted + self.updated
    }

    /// Total number of operations processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.skipped
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &ReconcileSummary) {
        self.removed += other.removed;
        self.role_changed += other.role_changed;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }

    /// Add an outcome to the summary
    pub fn add(&mut self, outcome: &OpOutcome) {
        match outcome {
            OpOutcome::Removed => self.removed += 1,
            OpOutcome::RoleChanged => self.role_changed += 1,
            OpOutcome::Inserted => self.inserted += 1,
            OpOutcome::Updated => self.updated += 1,
            OpOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_and_merge() {
        let mut first = ReconcileSummary::default();
        first.add(&OpOutcome::Inserted);
        first.add(&OpOutcome::Removed);
        first.add(&OpOutcome::Skipped {
            reason: "dry run".into(),
        });

        let mut second = ReconcileSummary::default();
        second.add(&OpOutcome::Updated);
        first.merge(&second);

        assert_eq!(first.total_changes(), 3);
        assert_eq!(first.total(), 4);
        assert!(!OpOutcome::Skipped { reason: String::new() }.is_change());
    }
}
