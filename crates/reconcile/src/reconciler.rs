//! Membership reconciliation.
//!
//! The reconciler fetches the actual members of a group, diffs them against
//! the declared members and applies the resulting plan one remote call at a
//! time, each under the retry policy. The first failure aborts the run;
//! running again recomputes the plan from live state, so a partially
//! applied run converges on the next attempt.

use crate::classify::RetryOptions;
use crate::config::ReconcileOptions;
use crate::context::{NoProgress, ProgressCallback};
use crate::duplicate::{DuplicateResolver, IdentityKind};
use crate::error::{ReconcileError, Result};
use crate::membership::{Identity, MembershipRecord, MembershipSet};
use crate::pager::list_all;
use crate::plan::{PlannedOp, ReconcilePlan};
use crate::retry::RetryPolicy;
use crate::types::{OpOutcome, ReconcileSummary};
use directory::{DirectoryClient, Entity, EntityKind, ListQuery, Member, Role};
use log::{debug, info};

/// Diff `desired` against whatever `fetch_actual` returns and feed every
/// planned operation, in order, to `apply`.
///
/// Stops at the first error.
pub fn reconcile_with<F, A>(
    desired: &MembershipSet,
    fetch_actual: F,
    mut apply: A,
) -> Result<ReconcileSummary>
where
    F: FnOnce() -> Result<MembershipSet>,
    A: FnMut(&PlannedOp) -> Result<OpOutcome>,
{
    let actual = fetch_actual()?;
    let plan = ReconcilePlan::compute(desired, &actual)?;
    let mut summary = ReconcileSummary::default();
    for op in &plan {
        summary.add(&apply(op)?);
    }
    Ok(summary)
}

/// Converges the members of groups in a directory.
pub struct Reconciler<'a> {
    client: &'a dyn DirectoryClient,
    policy: &'a RetryPolicy,
    options: ReconcileOptions,
}

impl<'a> Reconciler<'a> {
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

    /// All current members of `group`, across every page.
    pub fn fetch_members(&self, group: &str) -> Result<MembershipSet> {
        let query = ListQuery::members(group);
        let entities = list_all(
            self.client,
            self.policy,
            &query,
            &format!("list members of {group}"),
        )?;

        let mut set = MembershipSet::new();
        for entity in entities {
            let member = entity
                .into_member()
                .map_err(|source| ReconcileError::remote(format!("list members of {group}"), source))?;
            set.insert(MembershipRecord::from_member(&member));
        }
        debug!("{group} has {} member(s)", set.len());
        Ok(set)
    }

    /// Compute the plan for `group` without applying it.
    pub fn plan(&self, group: &str, desired: &MembershipSet) -> Result<ReconcilePlan> {
        let actual = self.fetch_members(group)?;
        ReconcilePlan::compute(desired, &actual)
    }

    /// Make the members of `group` equal to `desired`.
    pub fn reconcile(&self, group: &str, desired: &MembershipSet) -> Result<ReconcileSummary> {
        self.reconcile_with_progress(group, desired, &mut NoProgress)
    }

    /// Like [`Reconciler::reconcile`], reporting each step to `progress`.
    pub fn reconcile_with_progress(
        &self,
        group: &str,
        desired: &MembershipSet,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ReconcileSummary> {
        let plan = self.plan(group, desired)?;
        self.apply_plan(group, &plan, progress)
    }

    /// Apply an already computed plan.
    pub fn apply_plan(
        &self,
        group: &str,
        plan: &ReconcilePlan,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ReconcileSummary> {
        progress.on_plan(group, &plan.summary());
        let mut summary = ReconcileSummary::default();
        for op in plan {
            progress.on_op_start(group, op);
            let outcome = self.apply_op(group, op)?;
            progress.on_op_complete(group, op, &outcome);
            summary.add(&outcome);
        }
        Ok(summary)
    }

    /// Send one planned operation.
    pub fn apply_op(&self, group: &str, op: &PlannedOp) -> Result<OpOutcome> {
        debug!("{group}: {op}");
        if self.options.dry_run {
            return Ok(OpOutcome::Skipped {
                reason: "dry run".to_string(),
            });
        }

        let outcome = match op {
            PlannedOp::Delete { identity } => {
                let operation = format!("delete member {identity} from {group}");
                self.policy
                    .run(&operation, RetryOptions::default(), || {
                        self.client
                            .delete(EntityKind::Member, Some(group), identity.as_str())
                    })
                    .map_err(|source| ReconcileError::remote(operation, source))?;
                OpOutcome::Removed
            }
            PlannedOp::PatchRole { identity, role } => {
                let operation = format!("set role of {identity} in {group} to {role}");
                let body = member_body(identity, *role);
                self.policy
                    .run(&operation, RetryOptions::not_found(), || {
                        self.client.patch(Some(group), identity.as_str(), &body)
                    })
                    .map_err(|source| ReconcileError::remote(operation, source))?;
                OpOutcome::RoleChanged
            }
            PlannedOp::Upsert { identity, role } => self.upsert(group, identity, *role)?,
        };
        info!("{group}: {op}");
        Ok(outcome)
    }

    fn upsert(&self, group: &str, identity: &Identity, role: Role) -> Result<OpOutcome> {
        let kind = DuplicateResolver::new(self.client, self.policy).lookup_identity(identity)?;
        let exists = match kind {
            IdentityKind::Group => {
                if role != Role::Member {
                    return Err(ReconcileError::NestedGroupRole {
                        identity: identity.to_string(),
                        role,
                    });
                }
                let operation = format!("get member {identity} of {group}");
                match self.policy.run(&operation, RetryOptions::default(), || {
                    self.client.get_member(group, identity.as_str())
                }) {
                    Ok(_) => true,
                    Err(err) if err.is_not_found() => false,
                    Err(source) => return Err(ReconcileError::remote(operation, source)),
                }
            }
            IdentityKind::User => {
                let operation = format!("check membership of {identity} in {group}");
                match self.policy.run(&operation, RetryOptions::default(), || {
                    self.client.has_member(group, identity.as_str())
                }) {
                    Ok(found) => found,
                    // Not a directory user; let the insert report the real error
                    Err(err) if err.status() == Some(400) && err.reason() == Some("required") => {
                        false
                    }
                    Err(source) => return Err(ReconcileError::remote(operation, source)),
                }
            }
        };

        let body = member_body(identity, role);
        if exists {
            let operation = format!("update member {identity} of {group}");
            self.policy
                .run(&operation, RetryOptions::not_found(), || {
                    self.client.update(Some(group), identity.as_str(), &body)
                })
                .map_err(|source| ReconcileError::remote(operation, source))?;
            Ok(OpOutcome::Updated)
        } else {
            let operation = format!("insert member {identity} into {group}");
            self.policy
                .run(&operation, RetryOptions::default(), || {
                    self.client.insert(Some(group), &body)
                })
                .map_err(|source| ReconcileError::remote(operation, source))?;
            Ok(OpOutcome::Inserted)
        }
    }
}

fn member_body(identity: &Identity, role: Role) -> Entity {
    Entity::Member(Member::new(identity.as_str(), role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use directory::{ApiError, CallKind, Group, MemoryDirectory, User};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default()
                .with_deadline(Duration::from_secs(60))
                .with_max_jitter(Duration::ZERO),
        )
        .with_clock(Arc::new(ManualClock::new()))
    }

    fn desired(records: &[(&str, Role)]) -> MembershipSet {
        records
            .iter()
            .map(|(email, role)| MembershipRecord::new(email, *role))
            .collect()
    }

    fn directory_with_users(users: &[&str]) -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.add_group(Group::new("eng@x.com").with_name("eng")).unwrap();
        for user in users {
            dir.add_user(User::new(*user)).unwrap();
        }
        dir
    }

    #[test]
    fn test_fetch_members_across_three_pages() {
        let dir = MemoryDirectory::new().with_page_size(2);
        dir.add_group(Group::new("eng@x.com")).unwrap();
        for i in 0..6 {
            dir.add_member("eng@x.com", Member::new(format!("U{i}@x.com"), Role::Member))
                .unwrap();
        }
        let policy = policy();

        let set = Reconciler::new(&dir, &policy).fetch_members("eng@x.com").unwrap();
        assert_eq!(set.len(), 6);
        for i in 0..6 {
            assert!(set.contains(&Identity::new(&format!("u{i}@x.com"))));
        }
        let lists = dir.calls().iter().filter(|c| c.call == CallKind::List).count();
        assert_eq!(lists, 3);
    }

    #[test]
    fn test_converges_and_is_idempotent() {
        let dir = directory_with_users(&["a@x.com", "b@x.com", "c@x.com"]);
        dir.add_member("eng@x.com", Member::new("a@x.com", Role::Member)).unwrap();
        dir.add_member("eng@x.com", Member::new("b@x.com", Role::Owner)).unwrap();
        let policy = policy();
        let reconciler = Reconciler::new(&dir, &policy);
        let want = desired(&[("B@x.com", Role::Member), ("c@x.com", Role::Manager)]);

        let summary = reconciler.reconcile("eng@x.com", &want).unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.role_changed, 1);
        assert_eq!(summary.inserted, 1);

        let actual = reconciler.fetch_members("eng@x.com").unwrap();
        assert!(actual.same_roles(&want));

        dir.clear_calls();
        let again = reconciler.reconcile("eng@x.com", &want).unwrap();
        assert_eq!(again.total(), 0);
        assert!(dir.writes().is_empty());
    }

    #[test]
    fn test_reconcile_with_already_converged_does_nothing() {
        let want = desired(&[("a@x.com", Role::Owner), ("b@x.com", Role::Member)]);
        let mut applied = 0;
        let summary = reconcile_with(&want, || Ok(want.clone()), |_| {
            applied += 1;
            Ok(OpOutcome::Inserted)
        })
        .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(summary.total(), 0);
    }

    #[test]
    fn test_reconcile_with_applies_in_plan_order() {
        let actual = desired(&[("a@x.com", Role::Member), ("b@x.com", Role::Owner)]);
        let want = desired(&[("b@x.com", Role::Member), ("c@x.com", Role::Member)]);
        let mut seen = Vec::new();
        reconcile_with(&want, || Ok(actual), |op| {
            seen.push(op.verb());
            Ok(OpOutcome::Inserted)
        })
        .unwrap();
        assert_eq!(seen, vec!["delete", "patch", "upsert"]);
    }

    #[test]
    fn test_nested_group_owner_fails_without_retry() {
        let dir = directory_with_users(&[]);
        dir.add_group(Group::new("team@x.com")).unwrap();
        let policy = policy();
        let want = desired(&[("team@x.com", Role::Owner)]);

        let err = Reconciler::new(&dir, &policy)
            .reconcile("eng@x.com", &want)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NestedGroupRole { .. }));
        assert!(err.to_string().contains("nested groups should be role MEMBER"));
        assert!(dir.writes().is_empty());
    }

    #[test]
    fn test_nested_group_member_is_inserted_with_group_type() {
        let dir = directory_with_users(&[]);
        dir.add_group(Group::new("team@x.com")).unwrap();
        let policy = policy();

        let summary = Reconciler::new(&dir, &policy)
            .reconcile("eng@x.com", &desired(&[("team@x.com", Role::Member)]))
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert!(dir.members_of("eng@x.com")[0].meta.is_group());
    }

    #[test]
    fn test_unknown_identity_falls_through_to_insert() {
        let dir = directory_with_users(&[]);
        let policy = policy();

        let summary = Reconciler::new(&dir, &policy)
            .reconcile("eng@x.com", &desired(&[("outside@y.com", Role::Member)]))
            .unwrap();
        assert_eq!(summary.inserted, 1);
        let inserts = dir
            .calls()
            .iter()
            .filter(|c| c.call == CallKind::Insert)
            .count();
        assert_eq!(inserts, 1);
    }

    #[test]
    fn test_existing_member_found_by_has_member_is_updated() {
        let dir = directory_with_users(&["a@x.com"]);
        dir.add_member("eng@x.com", Member::new("a@x.com", Role::Member)).unwrap();
        let policy = policy();
        let reconciler = Reconciler::new(&dir, &policy);

        let outcome = reconciler
            .apply_op(
                "eng@x.com",
                &PlannedOp::Upsert {
                    identity: Identity::new("a@x.com"),
                    role: Role::Manager,
                },
            )
            .unwrap();
        assert_eq!(outcome, OpOutcome::Updated);
        assert_eq!(dir.members_of("eng@x.com")[0].role, Role::Manager);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let dir = directory_with_users(&["a@x.com"]);
        dir.fail_times(CallKind::Insert, 2, || ApiError::new(503, "Backend Error").into());
        dir.fail_next(CallKind::List, ApiError::new(429, "Rate Limit Exceeded"));
        let policy = policy();

        let summary = Reconciler::new(&dir, &policy)
            .reconcile("eng@x.com", &desired(&[("a@x.com", Role::Member)]))
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(dir.members_of("eng@x.com").len(), 1);
    }

    #[test]
    fn test_first_failure_aborts_and_names_operation() {
        let dir = directory_with_users(&["a@x.com", "b@x.com"]);
        dir.add_member("eng@x.com", Member::new("old@x.com", Role::Member)).unwrap();
        dir.fail_next(CallKind::Delete, ApiError::new(403, "Not Authorized"));
        let policy = policy();

        let err = Reconciler::new(&dir, &policy)
            .reconcile(
                "eng@x.com",
                &desired(&[("a@x.com", Role::Member), ("b@x.com", Role::Member)]),
            )
            .unwrap_err();
        assert!(err.to_string().starts_with("delete member old@x.com from eng@x.com failed"));
        assert_eq!(err.remote_source().and_then(directory::Error::status), Some(403));
        assert!(
            dir.calls()
                .iter()
                .all(|c| c.call != CallKind::Insert)
        );
    }

    #[test]
    fn test_missing_group_is_fatal() {
        let dir = MemoryDirectory::new();
        let policy = policy();
        let err = Reconciler::new(&dir, &policy)
            .reconcile("ghost@x.com", &desired(&[("a@x.com", Role::Member)]))
            .unwrap_err();
        assert!(err.remote_source().is_some_and(directory::Error::is_not_found));
    }

    #[test]
    fn test_dry_run_sends_no_writes() {
        let dir = directory_with_users(&["a@x.com"]);
        dir.add_member("eng@x.com", Member::new("old@x.com", Role::Member)).unwrap();
        let policy = policy();

        let summary = Reconciler::new(&dir, &policy)
            .with_options(ReconcileOptions {
                dry_run: true,
                ..ReconcileOptions::default()
            })
            .reconcile("eng@x.com", &desired(&[("a@x.com", Role::Member)]))
            .unwrap();
        assert_eq!(summary.skipped, 2);
        assert!(dir.writes().is_empty());
    }
}
