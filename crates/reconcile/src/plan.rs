//! Diff between desired and actual memberships.

use crate::error::{ReconcileError, Result};
use crate::membership::{Identity, MembershipSet};
use directory::Role;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    /// Remove a member that is not declared
    Delete { identity: Identity },
    /// Change the role of an existing member
    PatchRole { identity: Identity, role: Role },
    /// Add a declared member, or update it if it turns out to exist
    Upsert { identity: Identity, role: Role },
}

impl PlannedOp {
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Delete { identity }
            | Self::PatchRole { identity, .. }
            | Self::Upsert { identity, .. } => identity,
        }
    }

    /// Short verb for display.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Delete { .. } => "delete",
            Self::PatchRole { .. } => "patch",
            Self::Upsert { .. } => "upsert",
        }
    }
}

impl fmt::Display for PlannedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete { identity } => write!(f, "delete {identity}"),
            Self::PatchRole { identity, role } => write!(f, "set role of {identity} to {role}"),
            Self::Upsert { identity, role } => write!(f, "upsert {identity} as {role}"),
        }
    }
}

/// Ordered membership changes: deletes, then role patches, then upserts.
///
/// Within each kind, operations are sorted by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    ops: Vec<PlannedOp>,
}

impl ReconcilePlan {
    /// Compute the operations that turn `actual` into `desired`.
    ///
    /// Fails if an existing nested group would need a role other than MEMBER.
    pub fn compute(desired: &MembershipSet, actual: &MembershipSet) -> Result<Self> {
        let mut deletes = Vec::new();
        let mut patches = Vec::new();
        let mut upserts = Vec::new();

        for identity in actual.identities() {
            if !desired.contains(identity) {
                deletes.push(PlannedOp::Delete {
                    identity: identity.clone(),
                });
            }
        }

        for identity in desired.identities() {
            let Some(want) = desired.get(identity) else {
                continue;
            };
            match actual.get(identity) {
                Some(have) if have.role == want.role => {}
                Some(have) => {
                    if (have.is_group || want.is_group) && want.role != Role::Member {
                        return Err(ReconcileError::NestedGroupRole {
                            identity: identity.to_string(),
                            role: want.role,
                        });
                    }
                    patches.push(PlannedOp::PatchRole {
                        identity: identity.clone(),
                        role: want.role,
                    });
                }
                None => upserts.push(PlannedOp::Upsert {
                    identity: identity.clone(),
                    role: want.role,
                }),
            }
        }

        let mut ops = deletes;
        ops.extend(patches);
        ops.extend(upserts);
        Ok(Self { ops })
    }

    /// Plan that only adds members, for a parent that does not exist yet.
    pub fn additions(desired: &MembershipSet) -> Self {
        let ops = desired
            .identities()
            .into_iter()
            .filter_map(|identity| desired.get(identity))
            .map(|record| PlannedOp::Upsert {
                identity: record.identity.clone(),
                role: record.role,
            })
            .collect();
        Self { ops }
    }

    pub fn ops(&self) -> &[PlannedOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PlannedOp> {
        self.ops.iter()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.ops {
            match op {
                PlannedOp::Delete { .. } => summary.deletes += 1,
                PlannedOp::PatchRole { .. } => summary.patches += 1,
                PlannedOp::Upsert { .. } => summary.upserts += 1,
            }
        }
        summary
    }
}

impl<'a> IntoIterator for &'a ReconcilePlan {
    type Item = &'a PlannedOp;
    type IntoIter = std::slice::Iter<'a, PlannedOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Plan summary statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub deletes: usize,
    pub patches: usize,
    pub upserts: usize,
}

impl PlanSummary {
    /// Total number of changes
    pub fn total(&self) -> usize {
        self.deletes + self.patches + self.upserts
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}
