//! # Reconcile
//!
//! Drives a remote, eventually-consistent directory to a declared state.
//!
//! ## Core Concepts
//!
//! - **MembershipSet**: members of a group keyed by lower-cased email
//! - **ReconcilePlan**: deletes, then role patches, then upserts
//! - **RetryPolicy**: exponential backoff with jitter under a deadline,
//!   driven by [`classify_error`]
//! - **DuplicateResolver**: adopts an existing group after a conflicting create
//! - **EventualConsistencyWait**: polls until a write becomes visible
//!
//! ## Example
//!
//! ```no_run
//! use directory::{MemoryDirectory, Role};
//! use reconcile::{MembershipRecord, MembershipSet, Reconciler, RetryConfig, RetryPolicy};
//!
//! let directory = MemoryDirectory::new();
//! let policy = RetryPolicy::new(RetryConfig::from_timeout_minutes(5));
//!
//! let desired: MembershipSet = [
//!     MembershipRecord::new("alice@example.com", Role::Owner),
//!     MembershipRecord::new("bob@example.com", Role::Member),
//! ]
//! .into_iter()
//! .collect();
//!
//! let summary = Reconciler::new(&directory, &policy)
//!     .reconcile("eng@example.com", &desired)?;
//! println!("{} change(s)", summary.total_changes());
//! # Ok::<(), reconcile::ReconcileError>(())
//! ```
//!
//! ## Provider Traits
//!
//! - [`Clock`]: time source for retry loops ([`ManualClock`] in tests)
//! - [`ProgressCallback`]: receives plan and per-operation events
//! - [`ConfirmCallback`]: gates writes outside dry runs

pub mod classify;
pub mod clock;
pub mod config;
pub mod context;
pub mod duplicate;
pub mod error;
pub mod membership;
pub mod pager;
pub mod plan;
pub mod provision;
pub mod reconciler;
pub mod retry;
pub mod sync;
pub mod types;
pub mod wait;

// Re-export main types at crate root
pub use classify::{ErrorClass, RetryDecision, RetryOptions, classify_error, decide};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReconcileOptions, RetryConfig};
pub use context::{AutoConfirm, AutoDecline, ConfirmCallback, NoProgress, ProgressCallback};
pub use duplicate::{DuplicateResolver, IdentityKind, group_matches_actual};
pub use error::{ReconcileError, Result};
pub use membership::{Identity, MembershipRecord, MembershipSet};
pub use pager::list_all;
pub use plan::{PlanSummary, PlannedOp, ReconcilePlan};
pub use provision::{
    AliasChanges, GroupAction, GroupProvisioner, GroupSpec, UserOutcome, UserProvisioner,
    converge_aliases,
};
pub use reconciler::{Reconciler, reconcile_with};
pub use retry::{FnOperation, NoCallback, Operation, RetryCallback, RetryPolicy, op};
pub use sync::{GroupDeclaration, GroupPlan, SyncReport, Synchronizer};
pub use types::{OpOutcome, ReconcileSummary};
