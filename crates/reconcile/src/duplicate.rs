//! Resolution of conflicting creates and group-vs-user lookups.
//!
//! The directory treats some creates as upserts and others not, so a create
//! that fails with 409 is resolved by searching for the entity it collided
//! with and adopting it when every identifying field agrees.

use crate::classify::RetryOptions;
use crate::error::{ReconcileError, Result};
use crate::membership::Identity;
use crate::pager::list_all;
use crate::retry::RetryPolicy;
use directory::{DirectoryClient, Entity, Group, ListQuery};
use log::{debug, info};
use std::collections::BTreeSet;

/// Whether an identity is a nested group or a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Group,
    User,
}

/// Resolves 409s on create and classifies member identities.
pub struct DuplicateResolver<'a> {
    client: &'a dyn DirectoryClient,
    policy: &'a RetryPolicy,
}

impl<'a> DuplicateResolver<'a> {
    pub fn new(client: &'a dyn DirectoryClient, policy: &'a RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Find the existing group a conflicting create collided with.
    ///
    /// Lists groups in `domain` with the candidate's name and returns the
    /// first one that matches on every identifying field.
    pub fn resolve_create_conflict(&self, candidate: &Group, domain: &str) -> Result<Group> {
        let query = ListQuery::groups_in_domain(domain)
            .with_query(format!("name='{}'", candidate.name));
        let description = format!("list groups named {:?} in {domain}", candidate.name);
        let existing = list_all(self.client, self.policy, &query, &description)?;
        debug!(
            "Duplicate search for {} found {} candidate(s)",
            candidate.email,
            existing.len()
        );

        for entity in existing {
            let Entity::Group(group) = entity else {
                continue;
            };
            if group_matches_actual(candidate, &group)? {
                info!("Adopting existing group {} for {}", group.email, candidate.email);
                return Ok(group);
            }
        }

        Err(ReconcileError::NoDuplicateMatch {
            name: candidate.name.clone(),
            domain: domain.to_string(),
        })
    }

    /// Decide whether `identity` is a group (found by get) or a user (404).
    pub fn lookup_identity(&self, identity: &Identity) -> Result<IdentityKind> {
        let description = format!("look up group {identity}");
        match self.policy.run(&description, RetryOptions::default(), || {
            self.client.get_group(identity.as_str())
        }) {
            Ok(_) => Ok(IdentityKind::Group),
            Err(err) if err.is_not_found() => Ok(IdentityKind::User),
            Err(source) => Err(ReconcileError::remote(description, source)),
        }
    }
}

/// Compare a declared group to an existing one found by name.
///
/// Different names are simply not a match. Same name with a different
/// email, or with different alias sets when both declare aliases, is an
/// ambiguous duplicate and fails.
pub fn group_matches_actual(candidate: &Group, actual: &Group) -> Result<bool> {
    if candidate.name != actual.name {
        return Ok(false);
    }
    if !candidate.email.eq_ignore_ascii_case(&actual.email) {
        return Err(ReconcileError::DuplicateMismatch {
            name: candidate.name.clone(),
            field: "emails",
            expected: candidate.email.clone(),
            found: actual.email.clone(),
        });
    }
    if !candidate.aliases.is_empty() && !actual.aliases.is_empty() {
        let wanted = alias_set(&candidate.aliases);
        let found = alias_set(&actual.aliases);
        if wanted != found {
            return Err(ReconcileError::DuplicateMismatch {
                name: candidate.name.clone(),
                field: "aliases",
                expected: join(&wanted),
                found: join(&found),
            });
        }
    }
    Ok(true)
}

fn alias_set(aliases: &[String]) -> BTreeSet<String> {
    aliases.iter().map(|a| a.trim().to_lowercase()).collect()
}

fn join(aliases: &BTreeSet<String>) -> String {
    aliases.iter().cloned().collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use directory::MemoryDirectory;

    fn existing() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.add_group(
            Group::new("eng@x.com")
                .with_name("eng")
                .with_aliases(["engineering@x.com"]),
        )
        .unwrap();
        dir.add_group(Group::new("ops@x.com").with_name("ops")).unwrap();
        dir
    }

    #[test]
    fn test_resolves_to_matching_group() {
        let dir = existing();
        let policy = RetryPolicy::default();
        let candidate = Group::new("eng@x.com")
            .with_name("eng")
            .with_aliases(["Engineering@x.com"]);

        let found = DuplicateResolver::new(&dir, &policy)
            .resolve_create_conflict(&candidate, "x.com")
            .unwrap();
        assert_eq!(found.email, "eng@x.com");
        assert!(found.id.is_some());
    }

    #[test]
    fn test_different_email_is_fatal_and_quotes_both() {
        let dir = existing();
        let policy = RetryPolicy::default();
        let candidate = Group::new("eng2@x.com")
            .with_name("eng")
            .with_aliases(["engineering@x.com"]);

        let err = DuplicateResolver::new(&dir, &policy)
            .resolve_create_conflict(&candidate, "x.com")
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ReconcileError::DuplicateMismatch { field: "emails", .. }));
        assert!(message.contains("\"eng2@x.com\""));
        assert!(message.contains("\"eng@x.com\""));
    }

    #[test]
    fn test_no_candidate_is_no_match() {
        let dir = existing();
        let policy = RetryPolicy::default();
        let candidate = Group::new("sre@x.com").with_name("sre");

        let err = DuplicateResolver::new(&dir, &policy)
            .resolve_create_conflict(&candidate, "x.com")
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NoDuplicateMatch { .. }));
    }

    #[test]
    fn test_alias_sets_compare_order_independent() {
        let actual = Group::new("eng@x.com")
            .with_name("eng")
            .with_aliases(["b@x.com", "a@x.com"]);
        let same = Group::new("ENG@x.com")
            .with_name("eng")
            .with_aliases(["a@x.com", "B@x.com"]);
        let different = Group::new("eng@x.com")
            .with_name("eng")
            .with_aliases(["a@x.com"]);
        let undeclared = Group::new("eng@x.com").with_name("eng");

        assert!(group_matches_actual(&same, &actual).unwrap());
        assert!(group_matches_actual(&undeclared, &actual).unwrap());
        assert!(matches!(
            group_matches_actual(&different, &actual),
            Err(ReconcileError::DuplicateMismatch { field: "aliases", .. })
        ));
    }

    #[test]
    fn test_different_name_is_not_a_match() {
        let actual = Group::new("eng@x.com").with_name("eng");
        let other = Group::new("other@x.com").with_name("platform");
        assert!(!group_matches_actual(&other, &actual).unwrap());
    }

    #[test]
    fn test_lookup_identity() {
        let dir = existing();
        let policy = RetryPolicy::default();
        let resolver = DuplicateResolver::new(&dir, &policy);

        assert_eq!(
            resolver.lookup_identity(&Identity::new("OPS@x.com")).unwrap(),
            IdentityKind::Group
        );
        assert_eq!(
            resolver.lookup_identity(&Identity::new("alice@x.com")).unwrap(),
            IdentityKind::User
        );
    }
}
