//! # directory
//!
//! Typed boundary to a remote user/group directory service.
//!
//! This crate provides:
//! - Typed entities (groups, members, aliases, users, org units, ...)
//! - The [`DirectoryClient`] capability trait the reconciliation core calls
//! - A structured error type that preserves status codes and reasons
//! - An in-memory backend with fault injection for tests
//! - A JSON snapshot backend for offline planning
//!
//! ## Example
//!
//! ```no_run
//! use directory::{DirectoryClient, Entity, Group, ListQuery, MemoryDirectory};
//!
//! let dir = MemoryDirectory::new();
//! dir.insert(None, &Entity::Group(Group::new("eng@example.com").with_name("eng")))
//!     .expect("insert failed");
//!
//! let page = dir
//!     .list_page(&ListQuery::groups_in_domain("example.com"), None)
//!     .expect("list failed");
//! assert_eq!(page.items.len(), 1);
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod error;
pub mod types;

pub use backend::DirectoryClient;
pub use backend::memory::{Call, CallKind, DirectoryState, MemoryDirectory};
pub use backend::snapshot::{Snapshot, SnapshotDirectory};
pub use error::{ApiError, Error, Result};
pub use types::{
    Alias, Domain, Entity, EntityKind, Group, GroupSettings, ListQuery, Member, MemberMeta,
    OrgUnit, Page, ParseRoleError, Role, Schema, SchemaField, SchemaValue, User,
};
