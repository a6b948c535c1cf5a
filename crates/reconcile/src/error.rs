//! Error types for reconciliation.

use directory::Role;
use thiserror::Error;

/// Errors that can abort a reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A remote call failed; `source` is the error the directory returned.
    #[error("{operation} failed")]
    Remote {
        /// What was being attempted, e.g. "delete member a@x.com from eng@x.com"
        operation: String,
        #[source]
        source: directory::Error,
    },

    /// A nested group was given a role other than MEMBER.
    #[error("nested groups should be role MEMBER: {identity} was declared {role}")]
    NestedGroupRole { identity: String, role: Role },

    /// A duplicate was found by name but disagrees on another field.
    #[error(
        "unresolvable duplicate group mismatch: {field} for group {name:?} do not match: {expected:?} vs {found:?}"
    )]
    DuplicateMismatch {
        name: String,
        field: &'static str,
        expected: String,
        found: String,
    },

    /// A create conflicted but no existing entity matched.
    #[error("no match found for duplicate group {name:?} in domain {domain}")]
    NoDuplicateMatch { name: String, domain: String },

    /// An email had no domain part to scope a duplicate search.
    #[error("could not find domain in email {email:?}")]
    MissingDomain { email: String },

    /// A created entity never became readable before the deadline.
    #[error("taking too long to create {what}")]
    NotVisible {
        what: String,
        #[source]
        source: directory::Error,
    },

    /// A deleted entity was still readable when the deadline passed.
    #[error("taking too long to delete {what}: still visible")]
    StillPresent { what: String },

    /// The confirmation prompt could not be shown.
    #[error("confirmation failed: {0}")]
    Prompt(#[from] std::io::Error),
}

impl ReconcileError {
    /// Wrap a remote failure with the operation that produced it.
    pub fn remote(operation: impl Into<String>, source: directory::Error) -> Self {
        Self::Remote {
            operation: operation.into(),
            source,
        }
    }

    /// The directory error underneath, if this is a remote failure.
    pub fn remote_source(&self) -> Option<&directory::Error> {
        match self {
            Self::Remote { source, .. } | Self::NotVisible { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;
