//! Typed entities exchanged with the directory service.
//!
//! Every payload is decoded once, at the client boundary, into one of the
//! variants of [`Entity`]. Code above the boundary never inspects untyped
//! maps.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kinds of entities the directory manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Group,
    Member,
    Alias,
    Domain,
    OrgUnit,
    Schema,
    User,
    GroupSettings,
}

impl EntityKind {
    /// Stable lower-case name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Member => "member",
            Self::Alias => "alias",
            Self::Domain => "domain",
            Self::OrgUnit => "org_unit",
            Self::Schema => "schema",
            Self::User => "user",
            Self::GroupSettings => "group_settings",
        }
    }

    /// Whether entities of this kind live under a parent entity.
    pub fn is_nested(&self) -> bool {
        matches!(self, Self::Member | Self::Alias)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role string is not one of the known roles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid role {0:?}: expected OWNER, MANAGER or MEMBER")]
pub struct ParseRoleError(pub String);

/// Role of a member within a group.
///
/// The service is inconsistent about casing between reads and writes, so
/// parsing is case-insensitive and rendering is always upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    Owner,
    Manager,
    #[default]
    Member,
}

impl Role {
    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Manager => "MANAGER",
            Self::Member => "MEMBER",
        }
    }
}

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OWNER" => Ok(Self::Owner),
            "MANAGER" => Ok(Self::Manager),
            "MEMBER" => Ok(Self::Member),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = ParseRoleError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub non_editable_aliases: Vec<String>,
    #[serde(default)]
    pub direct_members_count: u64,
    #[serde(default)]
    pub admin_created: bool,
}

impl Group {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Domain part of the group email, if it has one.
    pub fn domain(&self) -> Option<&str> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
    }
}

/// Passthrough metadata the service attaches to a membership row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemberMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// "USER", "GROUP", "CUSTOMER", ...
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub member_type: Option<String>,
}

impl MemberMeta {
    /// Whether the service reports this member as a nested group.
    pub fn is_group(&self) -> bool {
        self.member_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("GROUP"))
    }
}

/// A membership row of a group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Member {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub email: String,
    #[serde(default)]
    pub role: Role,
    #[serde(flatten)]
    pub meta: MemberMeta,
}

impl Member {
    pub fn new(email: impl Into<String>, role: Role) -> Self {
        Self {
            email: email.into(),
            role,
            ..Default::default()
        }
    }
}

/// An alternate email address of a group or user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Alias {
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_email: Option<String>,
}

impl Alias {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            primary_email: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Domain {
    pub domain_name: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrgUnit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_unit_id: Option<String>,
    pub name: String,
    pub org_unit_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_org_unit_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One field definition of a custom user schema.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaField {
    pub field_name: String,
    pub field_type: String,
    #[serde(default)]
    pub multi_valued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    pub schema_name: String,
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

/// Value of a custom schema field on a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    List(Vec<SchemaValue>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub primary_email: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_unit_path: Option<String>,
    /// schema name -> field name -> value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_schemas: BTreeMap<String, BTreeMap<String, SchemaValue>>,
}

impl User {
    pub fn new(primary_email: impl Into<String>) -> Self {
        Self {
            primary_email: primary_email.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupSettings {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who_can_join: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who_can_view_membership: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who_can_post_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_external_members: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_only: Option<bool>,
}

/// Any entity the directory returns or accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum Entity {
    Group(Group),
    Member(Member),
    Alias(Alias),
    Domain(Domain),
    OrgUnit(OrgUnit),
    Schema(Schema),
    User(User),
    GroupSettings(GroupSettings),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Group(_) => EntityKind::Group,
            Self::Member(_) => EntityKind::Member,
            Self::Alias(_) => EntityKind::Alias,
            Self::Domain(_) => EntityKind::Domain,
            Self::OrgUnit(_) => EntityKind::OrgUnit,
            Self::Schema(_) => EntityKind::Schema,
            Self::User(_) => EntityKind::User,
            Self::GroupSettings(_) => EntityKind::GroupSettings,
        }
    }

    /// Natural key of the entity (email, alias, domain name, path, ...).
    pub fn key(&self) -> &str {
        match self {
            Self::Group(g) => &g.email,
            Self::Member(m) => &m.email,
            Self::Alias(a) => &a.alias,
            Self::Domain(d) => &d.domain_name,
            Self::OrgUnit(o) => &o.org_unit_path,
            Self::Schema(s) => &s.schema_name,
            Self::User(u) => &u.primary_email,
            Self::GroupSettings(s) => &s.email,
        }
    }

    fn mismatch(&self, expected: EntityKind) -> Error {
        Error::UnexpectedKind {
            expected,
            found: self.kind(),
        }
    }

    pub fn into_group(self) -> Result<Group> {
        match self {
            Self::Group(g) => Ok(g),
            other => Err(other.mismatch(EntityKind::Group)),
        }
    }

    pub fn into_member(self) -> Result<Member> {
        match self {
            Self::Member(m) => Ok(m),
            other => Err(other.mismatch(EntityKind::Member)),
        }
    }

    pub fn into_user(self) -> Result<User> {
        match self {
            Self::User(u) => Ok(u),
            other => Err(other.mismatch(EntityKind::User)),
        }
    }

    pub fn into_alias(self) -> Result<Alias> {
        match self {
            Self::Alias(a) => Ok(a),
            other => Err(other.mismatch(EntityKind::Alias)),
        }
    }
}

/// One page of a paginated list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Entity>,
    /// Token for the next page; `None` or empty means this is the last page
    pub next_page_token: Option<String>,
}

impl Page {
    /// The token to request next, if any.
    pub fn next_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Parameters of a list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub kind: EntityKind,
    /// Parent entity key for nested kinds (group for members, owner for aliases)
    pub parent: Option<String>,
    /// Restrict to entities whose email is in this domain
    pub domain: Option<String>,
    /// Customer scope for user listings
    pub customer: Option<String>,
    /// Free-form search expression, `field=value` or `field:value`
    pub query: Option<String>,
}

impl ListQuery {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            parent: None,
            domain: None,
            customer: None,
            query: None,
        }
    }

    /// Members of a group.
    pub fn members(group: impl Into<String>) -> Self {
        Self::new(EntityKind::Member).with_parent(group)
    }

    /// Aliases of a group or user.
    pub fn aliases(owner: impl Into<String>) -> Self {
        Self::new(EntityKind::Alias).with_parent(owner)
    }

    /// Groups whose email is in `domain`.
    pub fn groups_in_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::new(EntityKind::Group)
        }
    }

    /// Users of a customer.
    pub fn users(customer: impl Into<String>) -> Self {
        Self {
            customer: Some(customer.into()),
            ..Self::new(EntityKind::User)
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_is_case_insensitive() {
        assert_eq!("member".parse::<Role>().unwrap(), Role::Member);
        assert_eq!("Owner".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!(" MANAGER ".parse::<Role>().unwrap(), Role::Manager);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serializes_upper_case() {
        let json = serde_json::to_string(&Role::Manager).unwrap();
        assert_eq!(json, "\"MANAGER\"");
        let role: Role = serde_json::from_str("\"owner\"").unwrap();
        assert_eq!(role, Role::Owner);
    }

    #[test]
    fn test_member_decodes_type_field() {
        let json = r#"{"email":"Eng@X.com","role":"member","type":"GROUP","status":"ACTIVE"}"#;
        let member: Member = serde_json::from_str(json).unwrap();
        assert_eq!(member.role, Role::Member);
        assert!(member.meta.is_group());
        assert_eq!(member.meta.status.as_deref(), Some("ACTIVE"));
    }

    #[test]
    fn test_entity_tagged_roundtrip_and_kind_mismatch() {
        let entity = Entity::Group(Group::new("eng@x.com").with_name("eng"));
        let json = serde_json::to_string(&entity).unwrap();
        assert!(json.contains("\"entity\":\"group\""));
        let decoded: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.kind(), EntityKind::Group);

        let err = decoded.into_member().unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedKind {
                expected: EntityKind::Member,
                found: EntityKind::Group
            }
        ));
    }

    #[test]
    fn test_custom_schema_values_are_typed() {
        let json = r#"{"primary_email":"a@x.com","custom_schemas":{"hr":{"level":3,"remote":true,"tags":["x","y"]}}}"#;
        let user: User = serde_json::from_str(json).unwrap();
        let hr = &user.custom_schemas["hr"];
        assert_eq!(hr["level"], SchemaValue::Int(3));
        assert_eq!(hr["remote"], SchemaValue::Bool(true));
        assert!(matches!(hr["tags"], SchemaValue::List(ref v) if v.len() == 2));
    }

    #[test]
    fn test_group_domain() {
        assert_eq!(Group::new("eng@x.com").domain(), Some("x.com"));
        assert_eq!(Group::new("eng").domain(), None);
        assert_eq!(Group::new("eng@").domain(), None);
    }

    #[test]
    fn test_page_next_token_treats_empty_as_last() {
        let page = Page {
            items: Vec::new(),
            next_page_token: Some(String::new()),
        };
        assert_eq!(page.next_token(), None);
    }
}
