//! End-to-end convergence of declared groups.

use crate::config::ReconcileOptions;
use crate::context::{ConfirmCallback, ProgressCallback};
use crate::error::Result;
use crate::membership::MembershipSet;
use crate::plan::{PlanSummary, ReconcilePlan};
use crate::provision::{GroupAction, GroupProvisioner, GroupSpec};
use crate::reconciler::Reconciler;
use crate::retry::RetryPolicy;
use crate::types::{OpOutcome, ReconcileSummary};
use directory::DirectoryClient;
use log::info;

/// A group together with its declared members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDeclaration {
    pub spec: GroupSpec,
    pub members: MembershipSet,
}

/// What converging one group would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    pub email: String,
    pub action: GroupAction,
    pub members: ReconcilePlan,
}

impl GroupPlan {
    pub fn has_changes(&self) -> bool {
        self.action.is_change() || !self.members.is_empty()
    }

    pub fn member_summary(&self) -> PlanSummary {
        self.members.summary()
    }
}

/// What converging one group did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub email: String,
    pub action: GroupAction,
    pub summary: ReconcileSummary,
    /// The user declined the confirmation prompt
    pub declined: bool,
}

/// Provisions groups and reconciles their members.
pub struct Synchronizer<'a> {
    client: &'a dyn DirectoryClient,
    policy: &'a RetryPolicy,
    options: ReconcileOptions,
}

impl<'a> Synchronizer<'a> {
    pub fn new(client: &'a dyn DirectoryClient, policy: &'a RetryPolicy) -> Self {
        Self {
            client,
            policy,
            options: ReconcileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    fn provisioner(&self) -> GroupProvisioner<'a> {
        GroupProvisioner::new(self.client, self.policy).with_options(self.options)
    }

    fn reconciler(&self) -> Reconciler<'a> {
        Reconciler::new(self.client, self.policy).with_options(self.options)
    }

    /// Compute the group action and member plan without writing anything.
    pub fn plan(&self, declaration: &GroupDeclaration) -> Result<GroupPlan> {
        let email = declaration.spec.email.clone();
        let action = self.provisioner().diff(&declaration.spec)?;
        let members = match action {
            GroupAction::Create => ReconcilePlan::additions(&declaration.members),
            _ => self.reconciler().plan(&email, &declaration.members)?,
        };
        Ok(GroupPlan {
            email,
            action,
            members,
        })
    }

    /// Converge one group, asking `confirm` first unless this is a dry run.
    pub fn apply(
        &self,
        declaration: &GroupDeclaration,
        progress: &mut dyn ProgressCallback,
        confirm: &mut dyn ConfirmCallback,
    ) -> Result<SyncReport> {
        let plan = self.plan(declaration)?;
        let mut report = SyncReport {
            email: plan.email.clone(),
            action: plan.action.clone(),
            summary: ReconcileSummary::default(),
            declined: false,
        };

        if !plan.has_changes() {
            return Ok(report);
        }

        if self.options.dry_run {
            progress.on_plan(&plan.email, &plan.member_summary());
            let skipped = OpOutcome::Skipped {
                reason: "dry run".to_string(),
            };
            for op in &plan.members {
                progress.on_op_start(&plan.email, op);
                report.summary.add(&skipped);
                progress.on_op_complete(&plan.email, op, &skipped);
            }
            return Ok(report);
        }

        let prompt = format!(
            "Apply {} member change(s){} to {}?",
            plan.members.len(),
            if plan.action.is_change() {
                " and group changes"
            } else {
                ""
            },
            plan.email
        );
        if !confirm.confirm(&prompt)? {
            report.declined = true;
            report.summary.skipped = plan.members.len();
            return Ok(report);
        }

        self.provisioner().ensure_group(&declaration.spec)?;
        // Recompute against live state; creating the group may have adopted
        // an existing one with members.
        let summary = self.reconciler().reconcile_with_progress(
            &plan.email,
            &declaration.members,
            progress,
        )?;
        info!(
            "{}: {} change(s) applied",
            plan.email,
            summary.total_changes()
        );
        report.summary = summary;
        Ok(report)
    }
}
