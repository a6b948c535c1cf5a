//! Creating, updating and deleting top-level groups and users.
//!
//! These flows wrap single-entity writes with the parts that need more than
//! one call: duplicate adoption on create, alias convergence, and waiting
//! for the directory to reflect the change.

use crate::classify::RetryOptions;
use crate::config::ReconcileOptions;
use crate::duplicate::DuplicateResolver;
use crate::error::{ReconcileError, Result};
use crate::pager::list_all;
use crate::retry::RetryPolicy;
use crate::wait::EventualConsistencyWait;
use directory::{Alias, DirectoryClient, Entity, EntityKind, Group, ListQuery, User};
use log::{debug, info};
use std::collections::BTreeSet;

/// Declared attributes of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSpec {
    pub email: String,
    pub name: String,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    /// Adopt an existing group with the same name instead of failing on 409
    pub ignore_duplicates: bool,
}

impl GroupSpec {
    pub fn new(email: &str, name: impl Into<String>) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.aliases = aliases
            .into_iter()
            .map(|a| a.as_ref().trim().to_lowercase())
            .collect();
        self
    }

    pub fn ignore_duplicates(mut self, ignore: bool) -> Self {
        self.ignore_duplicates = ignore;
        self
    }

    /// The group entity this spec declares.
    pub fn to_group(&self) -> Group {
        Group {
            email: self.email.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            aliases: self.aliases.clone(),
            ..Group::default()
        }
    }
}

/// What provisioning would do (or did) to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// The group does not exist yet
    Create,
    /// The group exists but some attributes differ
    Update { changes: Vec<String> },
    /// The group matches its declaration
    NoChange,
}

impl GroupAction {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoChange)
    }
}

/// Aliases added and removed while converging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl AliasChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Group lifecycle operations.
pub struct GroupProvisioner<'a> {
    client: &'a dyn DirectoryClient,
    policy: &'a RetryPolicy,
    options: ReconcileOptions,
}

impl<'a> GroupProvisioner<'a> {
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

    /// Read the group, or `None` if it does not exist.
    pub fn fetch(&self, email: &str) -> Result<Option<Group>> {
        let operation = format!("get group {email}");
        match self
            .policy
            .run(&operation, RetryOptions::default(), || self.client.get_group(email))
        {
            Ok(group) => Ok(Some(group)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(source) => Err(ReconcileError::remote(operation, source)),
        }
    }

    /// Compare the declaration to the live group.
    pub fn diff(&self, spec: &GroupSpec) -> Result<GroupAction> {
        Ok(match self.fetch(&spec.email)? {
            None => GroupAction::Create,
            Some(current) => group_action(spec, &current),
        })
    }

    /// Create the group, adopting a compatible duplicate when allowed.
    pub fn create_group(&self, spec: &GroupSpec) -> Result<Group> {
        let candidate = spec.to_group();
        let body = Group {
            aliases: Vec::new(),
            ..candidate.clone()
        };
        let operation = format!("create group {}", spec.email);
        let created = self
            .policy
            .run(&operation, RetryOptions::not_found(), || {
                self.client.insert(None, &Entity::Group(body.clone()))
            })
            .and_then(Entity::into_group);

        let created = match created {
            Ok(group) => group,
            Err(err) if err.is_conflict() && spec.ignore_duplicates => {
                let domain = candidate
                    .domain()
                    .ok_or_else(|| ReconcileError::MissingDomain {
                        email: spec.email.clone(),
                    })?;
                debug!("{} already exists, looking for a duplicate in {domain}", spec.email);
                return DuplicateResolver::new(self.client, self.policy)
                    .resolve_create_conflict(&candidate, domain);
            }
            Err(source) => return Err(ReconcileError::remote(operation, source)),
        };
        info!("Created group {}", created.email);

        for alias in &spec.aliases {
            self.insert_alias(&spec.email, alias)?;
        }

        if self.options.confirm_visibility {
            return EventualConsistencyWait::new(self.policy)
                .wait_until_visible(&format!("group {}", spec.email), || {
                    self.client.get_group(&spec.email)
                });
        }
        Ok(Group {
            aliases: spec.aliases.clone(),
            ..created
        })
    }

    /// Patch name and description, then converge aliases.
    pub fn update_group(&self, spec: &GroupSpec, current: &Group) -> Result<Group> {
        let mut group = current.clone();
        if current.name != spec.name || current.description != spec.description {
            let operation = format!("update group {}", spec.email);
            let body = Entity::Group(Group {
                email: spec.email.clone(),
                name: spec.name.clone(),
                description: spec.description.clone(),
                ..Group::default()
            });
            group = self
                .policy
                .run(&operation, RetryOptions::not_found(), || {
                    self.client.patch(None, &spec.email, &body)
                })
                .and_then(Entity::into_group)
                .map_err(|source| ReconcileError::remote(operation, source))?;
            info!("Updated group {}", spec.email);
        }

        let changes = converge_aliases(
            self.client,
            self.policy,
            &spec.email,
            &current.aliases,
            &spec.aliases,
        )?;
        if !changes.is_empty() {
            group.aliases = spec.aliases.clone();
        }
        Ok(group)
    }

    /// Create or update so the group matches `spec`.
    pub fn ensure_group(&self, spec: &GroupSpec) -> Result<(Group, GroupAction)> {
        let current = self.fetch(&spec.email)?;
        let action = match &current {
            None => GroupAction::Create,
            Some(group) => group_action(spec, group),
        };
        if self.options.dry_run {
            let group = current.unwrap_or_else(|| spec.to_group());
            return Ok((group, action));
        }
        let group = match (&action, current) {
            (GroupAction::Create, _) | (_, None) => self.create_group(spec)?,
            (GroupAction::Update { .. }, Some(current)) => self.update_group(spec, &current)?,
            (GroupAction::NoChange, Some(current)) => current,
        };
        Ok((group, action))
    }

    /// Delete the group and wait until reads stop returning it.
    pub fn delete_group(&self, email: &str) -> Result<()> {
        let operation = format!("delete group {email}");
        self.policy
            .run(&operation, RetryOptions::default(), || {
                self.client.delete(EntityKind::Group, None, email)
            })
            .map_err(|source| ReconcileError::remote(operation, source))?;
        info!("Deleted group {email}");

        if self.options.confirm_visibility {
            EventualConsistencyWait::new(self.policy)
                .wait_until_gone(&format!("group {email}"), || self.client.get_group(email))?;
        }
        Ok(())
    }

    fn insert_alias(&self, owner: &str, alias: &str) -> Result<()> {
        insert_alias(self.client, self.policy, owner, alias)
    }
}

fn group_action(spec: &GroupSpec, current: &Group) -> GroupAction {
    let mut changes = Vec::new();
    if current.name != spec.name {
        changes.push(format!("name: {:?} -> {:?}", current.name, spec.name));
    }
    if current.description != spec.description {
        changes.push(format!(
            "description: {:?} -> {:?}",
            current.description.as_deref().unwrap_or(""),
            spec.description.as_deref().unwrap_or("")
        ));
    }
    let (add, remove) = alias_difference(&current.aliases, &spec.aliases);
    changes.extend(add.into_iter().map(|a| format!("add alias {a}")));
    changes.extend(remove.into_iter().map(|a| format!("remove alias {a}")));

    if changes.is_empty() {
        GroupAction::NoChange
    } else {
        GroupAction::Update { changes }
    }
}

/// Case-insensitive (to add, to remove) between current and desired aliases.
fn alias_difference(current: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let have: BTreeSet<String> = current.iter().map(|a| a.to_lowercase()).collect();
    let want: BTreeSet<String> = desired.iter().map(|a| a.to_lowercase()).collect();
    (
        want.difference(&have).cloned().collect(),
        have.difference(&want).cloned().collect(),
    )
}

fn insert_alias(
    client: &dyn DirectoryClient,
    policy: &RetryPolicy,
    owner: &str,
    alias: &str,
) -> Result<()> {
    let operation = format!("add alias {alias} to {owner}");
    policy
        .run(&operation, RetryOptions::not_found(), || {
            client.insert(Some(owner), &Entity::Alias(Alias::new(alias)))
        })
        .map_err(|source| ReconcileError::remote(operation, source))?;
    debug!("Added alias {alias} to {owner}");
    Ok(())
}

/// Insert missing aliases and delete extra ones.
pub fn converge_aliases(
    client: &dyn DirectoryClient,
    policy: &RetryPolicy,
    owner: &str,
    current: &[String],
    desired: &[String],
) -> Result<AliasChanges> {
    let (added, removed) = alias_difference(current, desired);
    for alias in &removed {
        let operation = format!("remove alias {alias} from {owner}");
        policy
            .run(&operation, RetryOptions::not_found(), || {
                client.delete(EntityKind::Alias, Some(owner), alias)
            })
            .map_err(|source| ReconcileError::remote(operation, source))?;
        debug!("Removed alias {alias} from {owner}");
    }
    for alias in &added {
        insert_alias(client, policy, owner, alias)?;
    }
    Ok(AliasChanges { added, removed })
}

/// Whether a user was created or an existing one taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    Created,
    Adopted,
}

/// User lifecycle operations.
pub struct UserProvisioner<'a> {
    client: &'a dyn DirectoryClient,
    policy: &'a RetryPolicy,
    customer: String,
    options: ReconcileOptions,
}

impl<'a> UserProvisioner<'a> {
    pub fn new(
        client: &'a dyn DirectoryClient,
        policy: &'a RetryPolicy,
        customer: impl Into<String>,
    ) -> Self {
        Self {
            client,
            policy,
            customer: customer.into(),
            options: ReconcileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Create `user`, or take over an existing user with the same primary email.
    pub fn create_or_adopt(&self, user: &User) -> Result<(User, UserOutcome)> {
        let email = user.primary_email.trim().to_lowercase();
        let query = ListQuery::users(&self.customer).with_query(format!("email:{email}"));
        let existing = list_all(
            self.client,
            self.policy,
            &query,
            &format!("search users for {email}"),
        )?
        .into_iter()
        .filter_map(|entity| entity.into_user().ok())
        .find(|u| u.primary_email.eq_ignore_ascii_case(&email));

        if let Some(existing) = existing {
            let key = existing.id.clone().unwrap_or_else(|| email.clone());
            let operation = format!("update user {email}");
            let body = Entity::User(User {
                aliases: Vec::new(),
                ..user.clone()
            });
            let updated = self
                .policy
                .run(&operation, RetryOptions::not_found(), || {
                    self.client.patch(None, &key, &body)
                })
                .and_then(Entity::into_user)
                .map_err(|source| ReconcileError::remote(operation, source))?;
            converge_aliases(
                self.client,
                self.policy,
                &email,
                &existing.aliases,
                &user.aliases,
            )?;
            info!("Adopted existing user {email}");
            return Ok((
                User {
                    aliases: user.aliases.clone(),
                    ..updated
                },
                UserOutcome::Adopted,
            ));
        }

        let operation = format!("create user {email}");
        let body = Entity::User(User {
            primary_email: email.clone(),
            aliases: Vec::new(),
            ..user.clone()
        });
        let created = self
            .policy
            .run(&operation, RetryOptions::default(), || {
                self.client.insert(None, &body)
            })
            .and_then(Entity::into_user)
            .map_err(|source| ReconcileError::remote(operation, source))?;
        info!("Created user {email}");

        for alias in &user.aliases {
            insert_alias(self.client, self.policy, &email, alias)?;
        }

        let user = if self.options.confirm_visibility {
            EventualConsistencyWait::new(self.policy)
                .wait_until_visible(&format!("user {email}"), || self.client.get_user(&email))?
        } else {
            User {
                aliases: user.aliases.clone(),
                ..created
            }
        };
        Ok((user, UserOutcome::Created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use directory::{ApiError, CallKind, MemoryDirectory};
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

    #[test]
    fn test_create_group_with_aliases_waits_for_visibility() {
        let dir = MemoryDirectory::new();
        dir.set_visibility_lag(2);
        let policy = policy();
        let spec = GroupSpec::new("Eng@x.com", "eng").with_aliases(["engineering@x.com"]);

        let group = GroupProvisioner::new(&dir, &policy).create_group(&spec).unwrap();
        assert_eq!(group.email, "eng@x.com");
        assert_eq!(group.aliases, vec!["engineering@x.com".to_string()]);
    }

    #[test]
    fn test_create_group_adopts_compatible_duplicate() {
        let dir = MemoryDirectory::new();
        dir.add_group(
            Group::new("eng@x.com")
                .with_name("eng")
                .with_aliases(["engineering@x.com"]),
        )
        .unwrap();
        let policy = policy();
        let spec = GroupSpec::new("eng@x.com", "eng")
            .with_aliases(["engineering@x.com"])
            .ignore_duplicates(true);

        let group = GroupProvisioner::new(&dir, &policy).create_group(&spec).unwrap();
        assert!(group.id.is_some());
        assert_eq!(dir.state().groups.len(), 1);
    }

    #[test]
    fn test_create_group_conflict_without_ignore_is_fatal() {
        let dir = MemoryDirectory::new();
        dir.add_group(Group::new("eng@x.com").with_name("eng")).unwrap();
        let policy = policy();

        let err = GroupProvisioner::new(&dir, &policy)
            .create_group(&GroupSpec::new("eng@x.com", "eng"))
            .unwrap_err();
        assert!(err.remote_source().is_some_and(directory::Error::is_conflict));
        let inserts = dir.calls().iter().filter(|c| c.call == CallKind::Insert).count();
        assert_eq!(inserts, 1);
    }

    #[test]
    fn test_create_group_missing_domain() {
        let dir = MemoryDirectory::new();
        dir.fail_next(CallKind::Insert, ApiError::conflict("Entity already exists."));
        let policy = policy();

        let err = GroupProvisioner::new(&dir, &policy)
            .create_group(&GroupSpec::new("eng", "eng").ignore_duplicates(true))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingDomain { .. }));
    }

    #[test]
    fn test_update_group_converges_aliases() {
        let dir = MemoryDirectory::new();
        let current = dir
            .add_group(
                Group::new("eng@x.com")
                    .with_name("eng")
                    .with_aliases(["old@x.com", "keep@x.com"]),
            )
            .unwrap();
        let policy = policy();
        let spec = GroupSpec::new("eng@x.com", "Engineering")
            .with_description("All engineers")
            .with_aliases(["KEEP@x.com", "new@x.com"]);

        let provisioner = GroupProvisioner::new(&dir, &policy);
        assert!(matches!(provisioner.diff(&spec).unwrap(), GroupAction::Update { ref changes } if changes.len() == 4));

        let group = provisioner.update_group(&spec, &current).unwrap();
        assert_eq!(group.name, "Engineering");

        let stored = dir.get_group("eng@x.com").unwrap();
        let mut aliases = stored.aliases.clone();
        aliases.sort();
        assert_eq!(aliases, vec!["keep@x.com".to_string(), "new@x.com".to_string()]);
        assert_eq!(stored.description.as_deref(), Some("All engineers"));
        assert_eq!(provisioner.diff(&spec).unwrap(), GroupAction::NoChange);
    }

    #[test]
    fn test_ensure_group_dry_run_writes_nothing() {
        let dir = MemoryDirectory::new();
        let policy = policy();
        let (group, action) = GroupProvisioner::new(&dir, &policy)
            .with_options(ReconcileOptions {
                dry_run: true,
                ..ReconcileOptions::default()
            })
            .ensure_group(&GroupSpec::new("eng@x.com", "eng"))
            .unwrap();
        assert_eq!(action, GroupAction::Create);
        assert_eq!(group.email, "eng@x.com");
        assert!(dir.writes().is_empty());
    }

    #[test]
    fn test_delete_group_waits_until_gone() {
        let dir = MemoryDirectory::new();
        dir.add_group(Group::new("eng@x.com")).unwrap();
        let policy = policy();

        GroupProvisioner::new(&dir, &policy).delete_group("eng@x.com").unwrap();
        assert!(dir.state().groups.is_empty());
    }

    #[test]
    fn test_user_created_when_absent() {
        let dir = MemoryDirectory::new();
        dir.set_visibility_lag(1);
        let policy = policy();
        let mut user = User::new("New@x.com");
        user.given_name = "New".into();
        user.aliases = vec!["n@x.com".into()];

        let (created, outcome) = UserProvisioner::new(&dir, &policy, "my_customer")
            .create_or_adopt(&user)
            .unwrap();
        assert_eq!(outcome, UserOutcome::Created);
        assert_eq!(created.primary_email, "new@x.com");
        assert_eq!(created.aliases, vec!["n@x.com".to_string()]);
    }

    #[test]
    fn test_existing_user_is_adopted() {
        let dir = MemoryDirectory::new();
        let mut existing = User::new("alice@x.com");
        existing.aliases = vec!["old@x.com".into()];
        dir.add_user(existing).unwrap();
        let policy = policy();

        let mut user = User::new("Alice@x.com");
        user.family_name = "Liddell".into();
        user.aliases = vec!["a@x.com".into()];

        let (adopted, outcome) = UserProvisioner::new(&dir, &policy, "my_customer")
            .create_or_adopt(&user)
            .unwrap();
        assert_eq!(outcome, UserOutcome::Adopted);
        assert_eq!(adopted.family_name, "Liddell");
        assert_eq!(dir.state().users.len(), 1);
        assert_eq!(dir.get_user("alice@x.com").unwrap().aliases, vec!["a@x.com".to_string()]);
    }
}
