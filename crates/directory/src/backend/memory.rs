//! In-memory directory backend.
//!
//! Mirrors the observable behavior of the remote service closely enough to
//! exercise the reconciliation core: case-insensitive keys, 404 for missing
//! entities and parents, 409 on duplicate creates, paginated listings and a
//! 400 "required" from `has_member` for identities the directory does not
//! know. Tests can additionally inject failures per call kind, delay the
//! visibility of freshly created entities, and inspect every call made.

use crate::backend::DirectoryClient;
use crate::error::{ApiError, Error, Result};
use crate::types::{
    Alias, Domain, Entity, EntityKind, Group, GroupSettings, ListQuery, Member, OrgUnit, Page,
    Schema, User,
};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_PAGE_SIZE: usize = 200;
const MEMBER_RESOURCE_KIND: &str = "admin#directory#member";

/// Everything the directory stores, in a serializable form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryState {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub users: Vec<User>,
    /// Lower-cased group email -> membership rows
    #[serde(default)]
    pub members: BTreeMap<String, Vec<Member>>,
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub org_units: Vec<OrgUnit>,
    #[serde(default)]
    pub schemas: Vec<Schema>,
    #[serde(default)]
    pub group_settings: Vec<GroupSettings>,
}

/// Kind of call made against the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Get,
    List,
    Insert,
    Patch,
    Update,
    Delete,
    HasMember,
}

impl CallKind {
    /// Whether the call mutates remote state.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Patch | Self::Update | Self::Delete)
    }
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub call: CallKind,
    pub kind: EntityKind,
    pub parent: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug)]
struct Hidden {
    kind: EntityKind,
    keys: Vec<String>,
    remaining: u32,
}

#[derive(Debug)]
struct Inner {
    state: DirectoryState,
    page_size: usize,
    faults: HashMap<CallKind, VecDeque<Error>>,
    visibility_lag: u32,
    hidden: Vec<Hidden>,
    calls: Vec<Call>,
    counter: u64,
}

/// Thread-safe in-memory [`DirectoryClient`].
#[derive(Debug)]
pub struct MemoryDirectory {
    inner: Mutex<Inner>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::from_state(DirectoryState::default())
    }

    /// Create a directory pre-populated with `state`.
    pub fn from_state(state: DirectoryState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                page_size: DEFAULT_PAGE_SIZE,
                faults: HashMap::new(),
                visibility_lag: 0,
                hidden: Vec::new(),
                calls: Vec::new(),
                counter: 0,
            }),
        }
    }

    /// Set the maximum number of items per listed page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .page_size = page_size.max(1);
        self
    }

    /// Make newly inserted groups and users invisible to the next `reads` gets.
    pub fn set_visibility_lag(&self, reads: u32) {
        self.lock().visibility_lag = reads;
    }

    /// Fail the next call of the given kind with `error`.
    ///
    /// Queued failures are consumed in order, one per matching call.
    pub fn fail_next(&self, call: CallKind, error: impl Into<Error>) {
        self.lock()
            .faults
            .entry(call)
            .or_default()
            .push_back(error.into());
    }

    /// Fail the next `times` calls of the given kind.
    pub fn fail_times<F>(&self, call: CallKind, times: usize, make: F)
    where
        F: Fn() -> Error,
    {
        let mut inner = self.lock();
        let queue = inner.faults.entry(call).or_default();
        for _ in 0..times {
            queue.push_back(make());
        }
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Only the calls that mutate state.
    pub fn writes(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.call.is_write())
            .cloned()
            .collect()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Copy of the stored state.
    pub fn state(&self) -> DirectoryState {
        self.lock().state.clone()
    }

    /// Membership rows of a group, empty if the group is unknown.
    pub fn members_of(&self, group: &str) -> Vec<Member> {
        let inner = self.lock();
        inner
            .state
            .group_email(group)
            .and_then(|email| inner.state.members.get(&email).cloned())
            .unwrap_or_default()
    }

    /// Store a group directly, bypassing faults, lag and the call log.
    pub fn add_group(&self, group: Group) -> Result<Group> {
        self.lock()
            .insert_entity(None, &Entity::Group(group))?
            .into_group()
    }

    /// Store a user directly, bypassing faults, lag and the call log.
    pub fn add_user(&self, user: User) -> Result<User> {
        self.lock()
            .insert_entity(None, &Entity::User(user))?
            .into_user()
    }

    /// Store a membership row directly, bypassing faults, lag and the call log.
    pub fn add_member(&self, group: &str, member: Member) -> Result<Member> {
        self.lock()
            .insert_entity(Some(group), &Entity::Member(member))?
            .into_member()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and pop an injected failure, if any.
    fn begin(
        &self,
        call: CallKind,
        kind: EntityKind,
        parent: Option<&str>,
        id: Option<&str>,
    ) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        trace!("memory directory: {call:?} {kind} parent={parent:?} id={id:?}");
        inner.calls.push(Call {
            call,
            kind,
            parent: parent.map(str::to_string),
            id: id.map(str::to_string),
        });
        if let Some(err) = inner.faults.get_mut(&call).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(inner)
    }
}

impl DirectoryClient for MemoryDirectory {
    fn get(&self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<Entity> {
        let mut inner = self.begin(CallKind::Get, kind, parent, Some(id))?;
        if inner.consume_hidden(kind, id) {
            return Err(ApiError::not_found(format!("{kind} {id}")).into());
        }
        inner
            .state
            .find(kind, parent, id)?
            .ok_or_else(|| ApiError::not_found(format!("{kind} {id}")).into())
    }

    fn list_page(&self, query: &ListQuery, page_token: Option<&str>) -> Result<Page> {
        let inner = self.begin(CallKind::List, query.kind, query.parent.as_deref(), None)?;
        let all = inner.state.list(query)?;
        let start = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ApiError::invalid(format!("Invalid page token: {token}")))?,
        };
        let end = start.saturating_add(inner.page_size).min(all.len());
        let items = all.get(start..end).map(<[Entity]>::to_vec).unwrap_or_default();
        Ok(Page {
            items,
            next_page_token: (end < all.len()).then(|| end.to_string()),
        })
    }

    fn insert(&self, parent: Option<&str>, entity: &Entity) -> Result<Entity> {
        let mut inner = self.begin(CallKind::Insert, entity.kind(), parent, Some(entity.key()))?;
        let created = inner.insert_entity(parent, entity)?;
        if inner.visibility_lag > 0 {
            let keys = match &created {
                Entity::Group(g) => vec![g.id.clone(), Some(g.email.clone())],
                Entity::User(u) => vec![u.id.clone(), Some(u.primary_email.clone())],
                _ => Vec::new(),
            };
            if !keys.is_empty() {
                let remaining = inner.visibility_lag;
                inner.hidden.push(Hidden {
                    kind: created.kind(),
                    keys: keys.into_iter().flatten().map(|k| k.to_lowercase()).collect(),
                    remaining,
                });
            }
        }
        Ok(created)
    }

    fn patch(&self, parent: Option<&str>, id: &str, entity: &Entity) -> Result<Entity> {
        let mut inner = self.begin(CallKind::Patch, entity.kind(), parent, Some(id))?;
        inner.write_entity(parent, id, entity, false)
    }

    fn update(&self, parent: Option<&str>, id: &str, entity: &Entity) -> Result<Entity> {
        let mut inner = self.begin(CallKind::Update, entity.kind(), parent, Some(id))?;
        inner.write_entity(parent, id, entity, true)
    }

    fn delete(&self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<()> {
        let mut inner = self.begin(CallKind::Delete, kind, parent, Some(id))?;
        inner.delete_entity(kind, parent, id)
    }

    fn has_member(&self, group: &str, member: &str) -> Result<bool> {
        let inner = self.begin(
            CallKind::HasMember,
            EntityKind::Member,
            Some(group),
            Some(member),
        )?;
        let group_email = inner
            .state
            .group_email(group)
            .ok_or_else(|| ApiError::not_found(format!("group {group}")))?;
        if !inner.state.email_taken(member) {
            return Err(ApiError::required("memberKey").into());
        }
        Ok(inner
            .state
            .members
            .get(&group_email)
            .is_some_and(|rows| rows.iter().any(|m| m.email.eq_ignore_ascii_case(member))))
    }
}

impl Inner {
    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        loop {
            let id = format!("{prefix}-{:06}", self.next_counter());
            if !self.state.id_in_use(&id) {
                return id;
            }
        }
    }

    fn consume_hidden(&mut self, kind: EntityKind, id: &str) -> bool {
        let id = id.to_lowercase();
        let hit = self
            .hidden
            .iter_mut()
            .find(|h| h.kind == kind && h.remaining > 0 && h.keys.contains(&id));
        let hidden = match hit {
            Some(h) => {
                h.remaining -= 1;
                true
            }
            None => false,
        };
        self.hidden.retain(|h| h.remaining > 0);
        hidden
    }

    fn insert_entity(&mut self, parent: Option<&str>, entity: &Entity) -> Result<Entity> {
        match entity.clone() {
            Entity::Group(mut group) => {
                group.email = group.email.to_lowercase();
                if self.state.email_taken(&group.email)
                    || group.aliases.iter().any(|a| self.state.email_taken(a))
                {
                    return Err(ApiError::conflict("Entity already exists.").into());
                }
                if group.id.is_none() {
                    group.id = Some(self.fresh_id("grp"));
                }
                group.direct_members_count = 0;
                self.state.members.entry(group.email.clone()).or_default();
                self.state.groups.push(group.clone());
                Ok(Entity::Group(group))
            }
            Entity::User(mut user) => {
                user.primary_email = user.primary_email.to_lowercase();
                if self.state.email_taken(&user.primary_email) {
                    return Err(ApiError::conflict("Entity already exists.").into());
                }
                if user.id.is_none() {
                    user.id = Some(self.fresh_id("usr"));
                }
                self.state.users.push(user.clone());
                Ok(Entity::User(user))
            }
            Entity::Member(mut member) => {
                let group_email = self.state.require_group(EntityKind::Member, parent)?;
                member.email = member.email.to_lowercase();
                let exists = self
                    .state
                    .members
                    .get(&group_email)
                    .is_some_and(|rows| rows.iter().any(|m| m.email == member.email));
                if exists {
                    return Err(ApiError::conflict("Member already exists.").into());
                }
                let is_group = self.state.group_index(&member.email).is_some();
                let known_id = if is_group {
                    self.state
                        .group_index(&member.email)
                        .and_then(|i| self.state.groups.get(i))
                        .and_then(|g| g.id.clone())
                } else {
                    self.state
                        .user_index(&member.email)
                        .and_then(|i| self.state.users.get(i))
                        .and_then(|u| u.id.clone())
                };
                member.id = match known_id {
                    Some(id) => Some(id),
                    None => Some(self.fresh_id("mbr")),
                };
                let etag = format!("\"etag-{}\"", self.next_counter());
                member.meta.etag = Some(etag);
                member.meta.resource_kind = Some(MEMBER_RESOURCE_KIND.to_string());
                member.meta.status = Some("ACTIVE".to_string());
                member.meta.member_type =
                    Some(if is_group { "GROUP" } else { "USER" }.to_string());
                self.state
                    .members
                    .entry(group_email.clone())
                    .or_default()
                    .push(member.clone());
                self.state.refresh_member_count(&group_email);
                Ok(Entity::Member(member))
            }
            Entity::Alias(alias) => {
                let owner = require_parent(EntityKind::Alias, parent)?;
                let value = alias.alias.to_lowercase();
                if self.state.email_taken(&value) {
                    return Err(ApiError::conflict("Entity already exists.").into());
                }
                let primary = self.state.push_alias(owner, &value)?;
                Ok(Entity::Alias(Alias {
                    alias: value,
                    primary_email: Some(primary),
                }))
            }
            Entity::Domain(domain) => {
                if self
                    .state
                    .domains
                    .iter()
                    .any(|d| d.domain_name.eq_ignore_ascii_case(&domain.domain_name))
                {
                    return Err(ApiError::conflict("Entity already exists.").into());
                }
                self.state.domains.push(domain.clone());
                Ok(Entity::Domain(domain))
            }
            Entity::OrgUnit(mut unit) => {
                if self
                    .state
                    .org_units
                    .iter()
                    .any(|o| o.org_unit_path.eq_ignore_ascii_case(&unit.org_unit_path))
                {
                    return Err(ApiError::conflict("Entity already exists.").into());
                }
                if unit.org_unit_id.is_none() {
                    unit.org_unit_id = Some(self.fresh_id("ou"));
                }
                self.state.org_units.push(unit.clone());
                Ok(Entity::OrgUnit(unit))
            }
            Entity::Schema(mut schema) => {
                if self
                    .state
                    .schemas
                    .iter()
                    .any(|s| s.schema_name.eq_ignore_ascii_case(&schema.schema_name))
                {
                    return Err(ApiError::conflict("Entity already exists.").into());
                }
                if schema.schema_id.is_none() {
                    schema.schema_id = Some(self.fresh_id("sch"));
                }
                self.state.schemas.push(schema.clone());
                Ok(Entity::Schema(schema))
            }
            Entity::GroupSettings(settings) => {
                if self
                    .state
                    .group_settings
                    .iter()
                    .any(|s| s.email.eq_ignore_ascii_case(&settings.email))
                {
                    return Err(ApiError::conflict("Entity already exists.").into());
                }
                self.state.group_settings.push(settings.clone());
                Ok(Entity::GroupSettings(settings))
            }
        }
    }

    fn write_entity(
        &mut self,
        parent: Option<&str>,
        id: &str,
        entity: &Entity,
        replace: bool,
    ) -> Result<Entity> {
        let missing = || Error::from(ApiError::not_found(format!("{} {id}", entity.kind())));
        match entity {
            Entity::Group(patch) => {
                let idx = self.state.group_index(id).ok_or_else(missing)?;
                let new_email = patch.email.to_lowercase();
                let old_email = self.state.groups[idx].email.clone();
                if !new_email.is_empty() && new_email != old_email {
                    if self.state.email_taken(&new_email) {
                        return Err(ApiError::conflict("Entity already exists.").into());
                    }
                    if let Some(rows) = self.state.members.remove(&old_email) {
                        self.state.members.insert(new_email.clone(), rows);
                    }
                    self.state.groups[idx].email = new_email;
                }
                let group = &mut self.state.groups[idx];
                if replace || !patch.name.is_empty() {
                    group.name = patch.name.clone();
                }
                if replace || patch.description.is_some() {
                    group.description = patch.description.clone();
                }
                Ok(Entity::Group(group.clone()))
            }
            Entity::Member(patch) => {
                let group_email = self.state.require_group(EntityKind::Member, parent)?;
                let row = self
                    .state
                    .members
                    .get_mut(&group_email)
                    .and_then(|rows| rows.iter_mut().find(|m| member_matches(m, id)))
                    .ok_or_else(missing)?;
                row.role = patch.role;
                Ok(Entity::Member(row.clone()))
            }
            Entity::User(patch) => {
                let idx = self.state.user_index(id).ok_or_else(missing)?;
                let user = &mut self.state.users[idx];
                if replace || !patch.given_name.is_empty() {
                    user.given_name = patch.given_name.clone();
                }
                if replace || !patch.family_name.is_empty() {
                    user.family_name = patch.family_name.clone();
                }
                if replace || patch.org_unit_path.is_some() {
                    user.org_unit_path = patch.org_unit_path.clone();
                }
                if replace {
                    user.suspended = patch.suspended;
                    user.suspension_reason = patch.suspension_reason.clone();
                    user.custom_schemas = patch.custom_schemas.clone();
                } else {
                    for (schema, fields) in &patch.custom_schemas {
                        user.custom_schemas
                            .entry(schema.clone())
                            .or_default()
                            .extend(fields.clone());
                    }
                }
                Ok(Entity::User(user.clone()))
            }
            Entity::OrgUnit(patch) => {
                let unit = self
                    .state
                    .org_units
                    .iter_mut()
                    .find(|o| {
                        o.org_unit_path.eq_ignore_ascii_case(id)
                            || o.org_unit_id.as_deref() == Some(id)
                    })
                    .ok_or_else(missing)?;
                if replace || !patch.name.is_empty() {
                    unit.name = patch.name.clone();
                }
                if replace || patch.description.is_some() {
                    unit.description = patch.description.clone();
                }
                if replace || patch.parent_org_unit_path.is_some() {
                    unit.parent_org_unit_path = patch.parent_org_unit_path.clone();
                }
                Ok(Entity::OrgUnit(unit.clone()))
            }
            Entity::Schema(patch) => {
                let schema = self
                    .state
                    .schemas
                    .iter_mut()
                    .find(|s| {
                        s.schema_name.eq_ignore_ascii_case(id) || s.schema_id.as_deref() == Some(id)
                    })
                    .ok_or_else(missing)?;
                schema.fields = patch.fields.clone();
                Ok(Entity::Schema(schema.clone()))
            }
            Entity::GroupSettings(patch) => {
                let settings = self
                    .state
                    .group_settings
                    .iter_mut()
                    .find(|s| s.email.eq_ignore_ascii_case(id))
                    .ok_or_else(missing)?;
                if replace {
                    *settings = GroupSettings {
                        email: settings.email.clone(),
                        ..patch.clone()
                    };
                } else {
                    merge_option(&mut settings.who_can_join, &patch.who_can_join);
                    merge_option(
                        &mut settings.who_can_view_membership,
                        &patch.who_can_view_membership,
                    );
                    merge_option(
                        &mut settings.who_can_post_message,
                        &patch.who_can_post_message,
                    );
                    merge_option(
                        &mut settings.allow_external_members,
                        &patch.allow_external_members,
                    );
                    merge_option(&mut settings.archive_only, &patch.archive_only);
                }
                Ok(Entity::GroupSettings(settings.clone()))
            }
            Entity::Alias(_) | Entity::Domain(_) => Err(ApiError::invalid(format!(
                "{} entities cannot be modified",
                entity.kind()
            ))
            .into()),
        }
    }

    fn delete_entity(&mut self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<()> {
        let missing = || Error::from(ApiError::not_found(format!("{kind} {id}")));
        match kind {
            EntityKind::Group => {
                let idx = self.state.group_index(id).ok_or_else(missing)?;
                let group = self.state.groups.remove(idx);
                self.state.members.remove(&group.email);
                self.state.drop_member_everywhere(&group.email);
            }
            EntityKind::User => {
                let idx = self.state.user_index(id).ok_or_else(missing)?;
                let user = self.state.users.remove(idx);
                self.state.drop_member_everywhere(&user.primary_email);
            }
            EntityKind::Member => {
                let group_email = self.state.require_group(kind, parent)?;
                let rows = self.state.members.entry(group_email.clone()).or_default();
                let idx = rows
                    .iter()
                    .position(|m| member_matches(m, id))
                    .ok_or_else(missing)?;
                rows.remove(idx);
                self.state.refresh_member_count(&group_email);
            }
            EntityKind::Alias => {
                let owner = require_parent(kind, parent)?;
                let aliases = self.state.aliases_mut(owner).ok_or_else(missing)?;
                let idx = aliases
                    .iter()
                    .position(|a| a.eq_ignore_ascii_case(id))
                    .ok_or_else(missing)?;
                aliases.remove(idx);
            }
            EntityKind::Domain => {
                let idx = self
                    .state
                    .domains
                    .iter()
                    .position(|d| d.domain_name.eq_ignore_ascii_case(id))
                    .ok_or_else(missing)?;
                self.state.domains.remove(idx);
            }
            EntityKind::OrgUnit => {
                let idx = self
                    .state
                    .org_units
                    .iter()
                    .position(|o| {
                        o.org_unit_path.eq_ignore_ascii_case(id)
                            || o.org_unit_id.as_deref() == Some(id)
                    })
                    .ok_or_else(missing)?;
                self.state.org_units.remove(idx);
            }
            EntityKind::Schema => {
                let idx = self
                    .state
                    .schemas
                    .iter()
                    .position(|s| {
                        s.schema_name.eq_ignore_ascii_case(id) || s.schema_id.as_deref() == Some(id)
                    })
                    .ok_or_else(missing)?;
                self.state.schemas.remove(idx);
            }
            EntityKind::GroupSettings => {
                let idx = self
                    .state
                    .group_settings
                    .iter()
                    .position(|s| s.email.eq_ignore_ascii_case(id))
                    .ok_or_else(missing)?;
                self.state.group_settings.remove(idx);
            }
        }
        Ok(())
    }
}

impl DirectoryState {
    fn group_index(&self, key: &str) -> Option<usize> {
        self.groups.iter().position(|g| {
            g.id.as_deref() == Some(key)
                || g.email.eq_ignore_ascii_case(key)
                || g.aliases.iter().any(|a| a.eq_ignore_ascii_case(key))
        })
    }

    fn user_index(&self, key: &str) -> Option<usize> {
        self.users.iter().position(|u| {
            u.id.as_deref() == Some(key)
                || u.primary_email.eq_ignore_ascii_case(key)
                || u.aliases.iter().any(|a| a.eq_ignore_ascii_case(key))
        })
    }

    /// Canonical (lower-cased) email of the group identified by `key`.
    fn group_email(&self, key: &str) -> Option<String> {
        self.group_index(key)
            .and_then(|i| self.groups.get(i))
            .map(|g| g.email.to_lowercase())
    }

    fn require_group(&self, kind: EntityKind, parent: Option<&str>) -> Result<String> {
        let key = require_parent(kind, parent)?;
        self.group_email(key)
            .ok_or_else(|| ApiError::not_found(format!("group {key}")).into())
    }

    fn email_taken(&self, email: &str) -> bool {
        self.group_index(email).is_some() || self.user_index(email).is_some()
    }

    fn id_in_use(&self, id: &str) -> bool {
        self.groups.iter().any(|g| g.id.as_deref() == Some(id))
            || self.users.iter().any(|u| u.id.as_deref() == Some(id))
            || self
                .members
                .values()
                .flatten()
                .any(|m| m.id.as_deref() == Some(id))
            || self
                .org_units
                .iter()
                .any(|o| o.org_unit_id.as_deref() == Some(id))
            || self
                .schemas
                .iter()
                .any(|s| s.schema_id.as_deref() == Some(id))
    }

    fn refresh_member_count(&mut self, group_email: &str) {
        let count = self.members.get(group_email).map_or(0, Vec::len) as u64;
        if let Some(group) = self
            .groups
            .iter_mut()
            .find(|g| g.email.eq_ignore_ascii_case(group_email))
        {
            group.direct_members_count = count;
        }
    }

    fn drop_member_everywhere(&mut self, email: &str) {
        let affected: Vec<String> = self
            .members
            .iter_mut()
            .filter_map(|(group, rows)| {
                let before = rows.len();
                rows.retain(|m| !m.email.eq_ignore_ascii_case(email));
                (rows.len() != before).then(|| group.clone())
            })
            .collect();
        for group in affected {
            self.refresh_member_count(&group);
        }
    }

    fn aliases_mut(&mut self, owner: &str) -> Option<&mut Vec<String>> {
        if let Some(idx) = self.group_index(owner) {
            return self.groups.get_mut(idx).map(|g| &mut g.aliases);
        }
        let idx = self.user_index(owner)?;
        self.users.get_mut(idx).map(|u| &mut u.aliases)
    }

    /// Append an alias to its owner, returning the owner's primary email.
    fn push_alias(&mut self, owner: &str, alias: &str) -> Result<String> {
        if let Some(idx) = self.group_index(owner) {
            let group = &mut self.groups[idx];
            group.aliases.push(alias.to_string());
            return Ok(group.email.clone());
        }
        if let Some(idx) = self.user_index(owner) {
            let user = &mut self.users[idx];
            user.aliases.push(alias.to_string());
            return Ok(user.primary_email.clone());
        }
        Err(ApiError::not_found(format!("alias owner {owner}")).into())
    }

    fn find(&self, kind: EntityKind, parent: Option<&str>, id: &str) -> Result<Option<Entity>> {
        let found = match kind {
            EntityKind::Group => self
                .group_index(id)
                .and_then(|i| self.groups.get(i))
                .cloned()
                .map(Entity::Group),
            EntityKind::User => self
                .user_index(id)
                .and_then(|i| self.users.get(i))
                .cloned()
                .map(Entity::User),
            EntityKind::Member => {
                let group_email = self.require_group(kind, parent)?;
                self.members
                    .get(&group_email)
                    .and_then(|rows| rows.iter().find(|m| member_matches(m, id)))
                    .cloned()
                    .map(Entity::Member)
            }
            EntityKind::Alias => {
                let owner = require_parent(kind, parent)?;
                let (primary, aliases) = if let Some(g) =
                    self.group_index(owner).and_then(|i| self.groups.get(i))
                {
                    (g.email.clone(), &g.aliases)
                } else if let Some(u) = self.user_index(owner).and_then(|i| self.users.get(i)) {
                    (u.primary_email.clone(), &u.aliases)
                } else {
                    return Err(ApiError::not_found(format!("alias owner {owner}")).into());
                };
                aliases
                    .iter()
                    .find(|a| a.eq_ignore_ascii_case(id))
                    .map(|a| {
                        Entity::Alias(Alias {
                            alias: a.clone(),
                            primary_email: Some(primary),
                        })
                    })
            }
            EntityKind::Domain => self
                .domains
                .iter()
                .find(|d| d.domain_name.eq_ignore_ascii_case(id))
                .cloned()
                .map(Entity::Domain),
            EntityKind::OrgUnit => self
                .org_units
                .iter()
                .find(|o| {
                    o.org_unit_path.eq_ignore_ascii_case(id) || o.org_unit_id.as_deref() == Some(id)
                })
                .cloned()
                .map(Entity::OrgUnit),
            EntityKind::Schema => self
                .schemas
                .iter()
                .find(|s| {
                    s.schema_name.eq_ignore_ascii_case(id) || s.schema_id.as_deref() == Some(id)
                })
                .cloned()
                .map(Entity::Schema),
            EntityKind::GroupSettings => self
                .group_settings
                .iter()
                .find(|s| s.email.eq_ignore_ascii_case(id))
                .cloned()
                .map(Entity::GroupSettings),
        };
        Ok(found)
    }

    fn list(&self, query: &ListQuery) -> Result<Vec<Entity>> {
        let q = query.query.as_deref();
        let in_domain = |email: &str| {
            query.domain.as_deref().is_none_or(|domain| {
                email
                    .rsplit_once('@')
                    .is_some_and(|(_, d)| d.eq_ignore_ascii_case(domain))
            })
        };
        let items = match query.kind {
            EntityKind::Group => self
                .groups
                .iter()
                .filter(|g| in_domain(&g.email))
                .filter(|g| query_matches(q, &[("name", &g.name), ("email", &g.email)]))
                .cloned()
                .map(Entity::Group)
                .collect(),
            EntityKind::User => self
                .users
                .iter()
                .filter(|u| in_domain(&u.primary_email))
                .filter(|u| {
                    query_matches(
                        q,
                        &[
                            ("email", &u.primary_email),
                            ("givenName", &u.given_name),
                            ("familyName", &u.family_name),
                        ],
                    )
                })
                .cloned()
                .map(Entity::User)
                .collect(),
            EntityKind::Member => {
                let group_email = self.require_group(query.kind, query.parent.as_deref())?;
                self.members
                    .get(&group_email)
                    .map(|rows| rows.iter().cloned().map(Entity::Member).collect())
                    .unwrap_or_default()
            }
            EntityKind::Alias => {
                let owner = require_parent(query.kind, query.parent.as_deref())?;
                let (primary, aliases) = if let Some(g) =
                    self.group_index(owner).and_then(|i| self.groups.get(i))
                {
                    (g.email.clone(), g.aliases.clone())
                } else if let Some(u) = self.user_index(owner).and_then(|i| self.users.get(i)) {
                    (u.primary_email.clone(), u.aliases.clone())
                } else {
                    return Err(ApiError::not_found(format!("alias owner {owner}")).into());
                };
                aliases
                    .into_iter()
                    .map(|alias| {
                        Entity::Alias(Alias {
                            alias,
                            primary_email: Some(primary.clone()),
                        })
                    })
                    .collect()
            }
            EntityKind::Domain => self.domains.iter().cloned().map(Entity::Domain).collect(),
            EntityKind::OrgUnit => self.org_units.iter().cloned().map(Entity::OrgUnit).collect(),
            EntityKind::Schema => self.schemas.iter().cloned().map(Entity::Schema).collect(),
            EntityKind::GroupSettings => self
                .group_settings
                .iter()
                .cloned()
                .map(Entity::GroupSettings)
                .collect(),
        };
        Ok(items)
    }
}

fn require_parent(kind: EntityKind, parent: Option<&str>) -> Result<&str> {
    parent.ok_or_else(|| Error::Backend(format!("{kind} requires a parent key")))
}

fn member_matches(member: &Member, key: &str) -> bool {
    member.email.eq_ignore_ascii_case(key) || member.id.as_deref() == Some(key)
}

fn merge_option<T: Clone>(target: &mut Option<T>, patch: &Option<T>) {
    if patch.is_some() {
        target.clone_from(patch);
    }
}

/// Match a `field=value` or `field:value` search expression.
fn query_matches(query: Option<&str>, fields: &[(&str, &str)]) -> bool {
    let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) else {
        return true;
    };
    let Some(split) = query.find(['=', ':']) else {
        return fields
            .iter()
            .any(|(_, value)| value.eq_ignore_ascii_case(query));
    };
    let (field, value) = (&query[..split], &query[split + 1..]);
    let value = value.trim().trim_matches(|c: char| c == '\'' || c == '"');
    fields
        .iter()
        .any(|(name, actual)| name.eq_ignore_ascii_case(field.trim()) && actual.eq_ignore_ascii_case(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn seeded() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.add_group(Group::new("eng@x.com").with_name("eng")).unwrap();
        dir.add_user(User::new("alice@x.com")).unwrap();
        dir
    }

    #[test]
    fn test_group_lookup_is_case_insensitive_and_by_alias() {
        let dir = MemoryDirectory::new();
        dir.add_group(
            Group::new("Eng@X.com")
                .with_name("eng")
                .with_aliases(["engineering@x.com"]),
        )
        .unwrap();

        assert_eq!(dir.get_group("ENG@x.com").unwrap().email, "eng@x.com");
        assert_eq!(dir.get_group("engineering@x.com").unwrap().name, "eng");
        assert!(dir.get_group("ops@x.com").unwrap_err().is_not_found());
    }

    #[test]
    fn test_member_insert_sets_type_and_rejects_duplicates() {
        let dir = seeded();
        dir.add_group(Group::new("ops@x.com")).unwrap();

        let user = dir
            .insert(
                Some("eng@x.com"),
                &Entity::Member(Member::new("Alice@X.com", Role::Owner)),
            )
            .unwrap()
            .into_member()
            .unwrap();
        assert_eq!(user.email, "alice@x.com");
        assert_eq!(user.meta.member_type.as_deref(), Some("USER"));

        let nested = dir
            .insert(
                Some("eng@x.com"),
                &Entity::Member(Member::new("ops@x.com", Role::Member)),
            )
            .unwrap()
            .into_member()
            .unwrap();
        assert!(nested.meta.is_group());

        let err = dir
            .insert(
                Some("eng@x.com"),
                &Entity::Member(Member::new("alice@x.com", Role::Member)),
            )
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(dir.get_group("eng@x.com").unwrap().direct_members_count, 2);
    }

    #[test]
    fn test_member_ops_on_missing_group_are_not_found() {
        let dir = MemoryDirectory::new();
        let err = dir
            .list_page(&ListQuery::members("nope@x.com"), None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_paginates_with_tokens() {
        let dir = MemoryDirectory::new().with_page_size(2);
        dir.add_group(Group::new("eng@x.com")).unwrap();
        for i in 0..5 {
            dir.add_member("eng@x.com", Member::new(format!("u{i}@x.com"), Role::Member))
                .unwrap();
        }

        let query = ListQuery::members("eng@x.com");
        let first = dir.list_page(&query, None).unwrap();
        assert_eq!(first.items.len(), 2);
        let second = dir.list_page(&query, first.next_token()).unwrap();
        assert_eq!(second.items.len(), 2);
        let third = dir.list_page(&query, second.next_token()).unwrap();
        assert_eq!(third.items.len(), 1);
        assert_eq!(third.next_token(), None);
    }

    #[test]
    fn test_group_list_filters_domain_and_name_query() {
        let dir = MemoryDirectory::new();
        dir.add_group(Group::new("eng@x.com").with_name("eng")).unwrap();
        dir.add_group(Group::new("eng@y.com").with_name("eng")).unwrap();
        dir.add_group(Group::new("ops@x.com").with_name("ops")).unwrap();

        let page = dir
            .list_page(&ListQuery::groups_in_domain("x.com").with_query("name=eng"), None)
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].key(), "eng@x.com");
    }

    #[test]
    fn test_has_member_requires_known_identity() {
        let dir = seeded();
        dir.add_member("eng@x.com", Member::new("alice@x.com", Role::Member))
            .unwrap();

        assert!(dir.has_member("eng@x.com", "ALICE@x.com").unwrap());
        let err = dir.has_member("eng@x.com", "ghost@x.com").unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.reason(), Some("required"));
    }

    #[test]
    fn test_injected_faults_are_consumed_in_order() {
        let dir = seeded();
        dir.fail_next(CallKind::Get, ApiError::new(503, "backend unavailable"));

        assert_eq!(dir.get_group("eng@x.com").unwrap_err().status(), Some(503));
        assert!(dir.get_group("eng@x.com").is_ok());
        assert_eq!(dir.calls().len(), 2);
        assert!(dir.writes().is_empty());
    }

    #[test]
    fn test_visibility_lag_hides_new_groups_from_gets() {
        let dir = MemoryDirectory::new();
        dir.set_visibility_lag(2);
        dir.insert(None, &Entity::Group(Group::new("new@x.com")))
            .unwrap();

        assert!(dir.get_group("new@x.com").unwrap_err().is_not_found());
        assert!(dir.get_group("new@x.com").unwrap_err().is_not_found());
        assert!(dir.get_group("new@x.com").is_ok());
    }

    #[test]
    fn test_delete_group_removes_nested_memberships() {
        let dir = seeded();
        dir.add_group(Group::new("ops@x.com")).unwrap();
        dir.add_member("eng@x.com", Member::new("ops@x.com", Role::Member))
            .unwrap();

        dir.delete(EntityKind::Group, None, "ops@x.com").unwrap();
        assert!(dir.members_of("eng@x.com").is_empty());
        assert!(
            dir.delete(EntityKind::Group, None, "ops@x.com")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_alias_insert_and_delete() {
        let dir = seeded();
        let alias = dir
            .insert(Some("eng@x.com"), &Entity::Alias(Alias::new("Engineering@x.com")))
            .unwrap()
            .into_alias()
            .unwrap();
        assert_eq!(alias.alias, "engineering@x.com");
        assert_eq!(alias.primary_email.as_deref(), Some("eng@x.com"));

        let err = dir
            .insert(Some("alice@x.com"), &Entity::Alias(Alias::new("engineering@x.com")))
            .unwrap_err();
        assert!(err.is_conflict());

        dir.delete(EntityKind::Alias, Some("eng@x.com"), "engineering@x.com")
            .unwrap();
        assert!(dir.get_group("eng@x.com").unwrap().aliases.is_empty());
    }

    #[test]
    fn test_patch_member_role() {
        let dir = seeded();
        dir.add_member("eng@x.com", Member::new("alice@x.com", Role::Member))
            .unwrap();
        let patched = dir
            .patch(
                Some("eng@x.com"),
                "alice@x.com",
                &Entity::Member(Member::new("alice@x.com", Role::Manager)),
            )
            .unwrap()
            .into_member()
            .unwrap();
        assert_eq!(patched.role, Role::Manager);
        assert_eq!(patched.meta.status.as_deref(), Some("ACTIVE"));
    }

    #[test]
    fn test_query_matches() {
        assert!(query_matches(None, &[("name", "eng")]));
        assert!(query_matches(Some("name='Eng'"), &[("name", "eng")]));
        assert!(query_matches(Some("email:a@x.com"), &[("email", "A@x.com")]));
        assert!(!query_matches(Some("name=ops"), &[("name", "eng")]));
        assert!(!query_matches(Some("title=eng"), &[("name", "eng")]));
    }
}
