//! Client abstraction for directory operations.
//!
//! The [`DirectoryClient`] trait is the only way the reconciliation core
//! touches the remote service, allowing for different implementations
//! (a real API client, the in-memory directory used in tests, or the JSON
//! snapshot used by the CLI).

pub mod memory;
pub mod snapshot;

use crate::error::Result;
use crate::types::{Entity, EntityKind, Group, ListQuery, Member, Page, User};

/// Capability set of a remote directory.
///
/// Every call is blocking. Keys are compared case-insensitively by the
/// service, but callers are expected to send lower-cased emails anyway.
pub trait DirectoryClient: Send + Sync {
    /// Fetch a single entity. `parent` is required for nested kinds.
    fn get(&self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<Entity>;

    /// Fetch one page of a listing. `page_token` is `None` for the first page.
    fn list_page(&self, query: &ListQuery, page_token: Option<&str>) -> Result<Page>;

    /// Create an entity, under `parent` for nested kinds.
    fn insert(&self, parent: Option<&str>, entity: &Entity) -> Result<Entity>;

    /// Partially update an entity; fields left empty in `entity` are kept.
    fn patch(&self, parent: Option<&str>, id: &str, entity: &Entity) -> Result<Entity>;

    /// Replace an entity.
    fn update(&self, parent: Option<&str>, id: &str, entity: &Entity) -> Result<Entity>;

    /// Delete an entity.
    fn delete(&self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<()>;

    /// Whether `member` belongs to `group`. Only meaningful for user identities.
    fn has_member(&self, group: &str, member: &str) -> Result<bool>;

    /// Fetch a group by id, email or alias.
    fn get_group(&self, key: &str) -> Result<Group> {
        self.get(EntityKind::Group, None, key)?.into_group()
    }

    /// Fetch a user by id or primary email.
    fn get_user(&self, key: &str) -> Result<User> {
        self.get(EntityKind::User, None, key)?.into_user()
    }

    /// Fetch a membership row of a group.
    fn get_member(&self, group: &str, member: &str) -> Result<Member> {
        self.get(EntityKind::Member, Some(group), member)?
            .into_member()
    }
}
