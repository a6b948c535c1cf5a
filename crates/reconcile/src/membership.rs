//! Membership records keyed by normalized identity.

use directory::{Member, MemberMeta, Role};
use std::collections::HashMap;
use std::collections::hash_map;
use std::fmt;

/// Lower-cased email used as the key of a membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    pub fn new(email: &str) -> Self {
        Self(email.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Domain part of the email, if present.
    pub fn domain(&self) -> Option<&str> {
        self.0
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
    }
}

impl From<&str> for Identity {
    fn from(email: &str) -> Self {
        Self::new(email)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One identity's membership in a parent group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    pub identity: Identity,
    pub role: Role,
    /// Passthrough metadata from the directory (etag, status, type)
    pub meta: MemberMeta,
    /// Whether the identity is a nested group rather than a user
    pub is_group: bool,
}

impl MembershipRecord {
    pub fn new(email: &str, role: Role) -> Self {
        Self {
            identity: Identity::new(email),
            role,
            meta: MemberMeta::default(),
            is_group: false,
        }
    }

    /// Mark the identity as a nested group.
    pub fn group(mut self) -> Self {
        self.is_group = true;
        self
    }

    /// Build a record from a membership row returned by the directory.
    pub fn from_member(member: &Member) -> Self {
        Self {
            identity: Identity::new(&member.email),
            role: member.role,
            meta: member.meta.clone(),
            is_group: member.meta.is_group(),
        }
    }
}

/// Memberships keyed by identity. Inserting an existing identity replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSet {
    records: HashMap<Identity, MembershipRecord>,
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from directory membership rows.
    pub fn from_members<'a, I>(members: I) -> Self
    where
        I: IntoIterator<Item = &'a Member>,
    {
        members.into_iter().map(MembershipRecord::from_member).collect()
    }

    /// Insert a record, returning the one it replaced.
    pub fn insert(&mut self, record: MembershipRecord) -> Option<MembershipRecord> {
        self.records.insert(record.identity.clone(), record)
    }

    pub fn get(&self, identity: &Identity) -> Option<&MembershipRecord> {
        self.records.get(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.records.contains_key(identity)
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<MembershipRecord> {
        self.records.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> hash_map::Values<'_, Identity, MembershipRecord> {
        self.records.values()
    }

    /// Identities in sorted order.
    pub fn identities(&self) -> Vec<&Identity> {
        let mut identities: Vec<_> = self.records.keys().collect();
        identities.sort();
        identities
    }

    /// Same identities with the same roles, ignoring metadata.
    pub fn same_roles(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|r| other.get(&r.identity).is_some_and(|o| o.role == r.role))
    }
}

impl FromIterator<MembershipRecord> for MembershipSet {
    fn from_iter<I: IntoIterator<Item = MembershipRecord>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl Extend<MembershipRecord> for MembershipSet {
    fn extend<I: IntoIterator<Item = MembershipRecord>>(&mut self, iter: I) {
        for record in iter {
            self.insert(record);
        }
    }
}

impl<'a> IntoIterator for &'a MembershipSet {
    type Item = &'a MembershipRecord;
    type IntoIter = hash_map::Values<'a, Identity, MembershipRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
