use anyhow::{Context, Result};
use directory::Role;
use reconcile::{GroupDeclaration, GroupSpec, MembershipRecord, MembershipSet, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Scopes requested when the config does not list any.
pub const DEFAULT_OAUTH_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/admin.directory.group",
    "https://www.googleapis.com/auth/admin.directory.user",
    "https://www.googleapis.com/auth/admin.directory.userschema",
];

const MAX_LOCAL_PART: usize = 63;

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("dirsync"))
}

/// Resolve the config file, honoring an explicit `--config` path
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(expand(&path.to_string_lossy())),
        None => Ok(config_dir()?.join("config.toml")),
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Problems found while validating a loaded config.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unable to parse email address {email:?}: {reason}")]
    InvalidEmail { email: String, reason: &'static str },

    #[error("local portion of email {0:?} exceeds 63 characters")]
    LocalPartTooLong(String),

    #[error("group {0} is declared more than once")]
    DuplicateGroup(String),

    #[error("member {member} is declared more than once in group {group}")]
    DuplicateMember { group: String, member: String },

    #[error("group {0} is not in the config")]
    UnknownGroup(String),
}

/// Check that `email` is a bare `local@domain` address.
pub fn validate_email(email: &str) -> std::result::Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidEmail {
        email: email.to_string(),
        reason,
    };

    if email.is_empty() {
        return Err(invalid("empty address"));
    }
    if email.chars().any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '"' | ',')) {
        return Err(invalid("expected an email format of myemail@domain.com"));
    }
    let Some((local, domain)) = email.rsplit_once('@') else {
        return Err(invalid("missing @"));
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(invalid("expected an email format of myemail@domain.com"));
    }
    if local.len() > MAX_LOCAL_PART {
        return Err(ConfigError::LocalPartTooLong(email.to_string()));
    }
    Ok(())
}

// ============================================================================
// Config file
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub directory: DirectorySettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySettings {
    #[serde(default = "default_snapshot")]
    pub snapshot: String,
    #[serde(default = "default_customer")]
    pub customer_id: String,
    #[serde(default)]
    pub impersonated_user_email: Option<String>,
    #[serde(default)]
    pub oauth_scopes: Vec<String>,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            snapshot: default_snapshot(),
            customer_id: default_customer(),
            impersonated_user_email: None,
            oauth_scopes: Vec::new(),
        }
    }
}

fn default_snapshot() -> String {
    "~/.local/share/dirsync/snapshot.json".to_string()
}

fn default_customer() -> String {
    "my_customer".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            jitter_ms: default_jitter_ms(),
            max_delay_secs: None,
        }
    }
}

const fn default_timeout_minutes() -> u64 {
    5
}

const fn default_jitter_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub ignore_duplicates: bool,
    #[serde(default)]
    pub members: Vec<MemberEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEntry {
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

impl Config {
    /// Load and validate the config at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if let Some(admin) = &self.directory.impersonated_user_email {
            validate_email(admin)?;
        }

        let mut groups = HashSet::new();
        for group in &self.groups {
            validate_email(&group.email)?;
            if !groups.insert(group.email.to_lowercase()) {
                return Err(ConfigError::DuplicateGroup(group.email.clone()));
            }
            for alias in &group.aliases {
                validate_email(alias)?;
            }

            let mut members = HashSet::new();
            for member in &group.members {
                validate_email(&member.email)?;
                if !members.insert(member.email.to_lowercase()) {
                    return Err(ConfigError::DuplicateMember {
                        group: group.email.clone(),
                        member: member.email.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        expand(&self.directory.snapshot)
    }

    /// Configured scopes, or the built-in defaults when none are listed
    pub fn oauth_scopes(&self) -> Vec<String> {
        if self.directory.oauth_scopes.is_empty() {
            DEFAULT_OAUTH_SCOPES.iter().map(ToString::to_string).collect()
        } else {
            self.directory.oauth_scopes.clone()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let config = RetryConfig::from_timeout_minutes(self.retry.timeout_minutes)
            .with_max_jitter(Duration::from_millis(self.retry.jitter_ms));
        match self.retry.max_delay_secs {
            Some(secs) => config.with_max_delay(Duration::from_secs(secs)),
            None => config,
        }
    }

    /// Declarations for every group, or only `only` when given
    pub fn declarations(
        &self,
        only: Option<&str>,
    ) -> std::result::Result<Vec<GroupDeclaration>, ConfigError> {
        let selected: Vec<&GroupEntry> = match only {
            Some(email) => {
                let entry = self
                    .groups
                    .iter()
                    .find(|g| g.email.eq_ignore_ascii_case(email.trim()))
                    .ok_or_else(|| ConfigError::UnknownGroup(email.to_string()))?;
                vec![entry]
            }
            None => self.groups.iter().collect(),
        };
        Ok(selected.into_iter().map(GroupEntry::declaration).collect())
    }
}

impl GroupEntry {
    pub fn declaration(&self) -> GroupDeclaration {
        let mut spec = GroupSpec::new(&self.email, self.name.clone())
            .with_aliases(&self.aliases)
            .ignore_duplicates(self.ignore_duplicates);
        if let Some(description) = &self.description {
            spec = spec.with_description(description.clone());
        }

        let members: MembershipSet = self
            .members
            .iter()
            .map(|m| MembershipRecord::new(&m.email, m.role))
            .collect();

        GroupDeclaration { spec, members }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::Identity;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[directory]
snapshot = "/tmp/dirsync/snapshot.json"
impersonated_user_email = "admin@x.com"

[retry]
timeout_minutes = 2
jitter_ms = 0
max_delay_secs = 30

[[groups]]
email = "Eng@x.com"
name = "eng"
description = "Engineering"
aliases = ["engineering@x.com"]

[[groups.members]]
email = "alice@x.com"
role = "owner"

[[groups.members]]
email = "bob@x.com"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.directory.customer_id, "my_customer");
        assert_eq!(config.snapshot_path(), PathBuf::from("/tmp/dirsync/snapshot.json"));
        assert_eq!(config.oauth_scopes().len(), DEFAULT_OAUTH_SCOPES.len());

        let retry = config.retry_config();
        assert_eq!(retry.deadline, Duration::from_secs(120));
        assert_eq!(retry.max_jitter, Duration::ZERO);
        assert_eq!(retry.max_delay, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_declarations_default_role_and_lowercase() {
        let config = Config::parse(SAMPLE).unwrap();
        let decls = config.declarations(None).unwrap();
        assert_eq!(decls.len(), 1);

        let decl = &decls[0];
        assert_eq!(decl.spec.email, "eng@x.com");
        assert_eq!(decl.spec.description.as_deref(), Some("Engineering"));
        assert_eq!(
            decl.members.get(&Identity::new("alice@x.com")).map(|r| r.role),
            Some(Role::Owner)
        );
        assert_eq!(
            decl.members.get(&Identity::new("bob@x.com")).map(|r| r.role),
            Some(Role::Member)
        );
    }

    #[test]
    fn test_declarations_filter() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.declarations(Some("ENG@x.com")).unwrap().len(), 1);
        assert_eq!(
            config.declarations(Some("ops@x.com")).unwrap_err(),
            ConfigError::UnknownGroup("ops@x.com".to_string())
        );
    }

    #[test]
    fn test_invalid_role_rejected() {
        let content = r#"
[[groups]]
email = "eng@x.com"
name = "eng"
members = [{ email = "a@x.com", role = "admin" }]
"#;
        assert!(Config::parse(content).is_err());
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let content = r#"
[[groups]]
email = "eng@x.com"
name = "eng"
members = [{ email = "a@x.com" }, { email = "A@x.com", role = "OWNER" }]
"#;
        let err = Config::parse(content).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("alice@example.com").is_ok());
        assert!(validate_email(&format!("{}@x.com", "a".repeat(63))).is_ok());
        assert_eq!(
            validate_email(&format!("{}@x.com", "a".repeat(64))),
            Err(ConfigError::LocalPartTooLong(format!("{}@x.com", "a".repeat(64))))
        );
        assert!(validate_email("Alice <alice@example.com>").is_err());
        assert!(validate_email("alice").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.groups.len(), 1);

        let missing = Config::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(missing.to_string().contains("Could not read"));
    }

    #[test]
    fn test_config_path_prefers_explicit() {
        let path = config_path(Some(Path::new("/etc/dirsync.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/etc/dirsync.toml"));
    }
}
