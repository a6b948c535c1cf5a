//! Error types for directory operations.
//!
//! Remote failures keep the shape the directory service reports them in:
//! a status code, an optional machine-readable reason and a message. Some
//! upstream failures arrive as bare strings with no structured fields at
//! all, so those are carried verbatim in [`Error::Unstructured`].

use crate::types::EntityKind;
use std::fmt;
use thiserror::Error;

/// Structured error reported by the directory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP-style status code
    pub code: u16,
    /// Machine-readable reason of the first reported error (e.g. "quotaExceeded")
    pub reason: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl ApiError {
    /// Create an error with a status code and message.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: None,
            message: message.into(),
        }
    }

    /// Attach a machine-readable reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// 404 for an entity that does not exist (or is not visible yet).
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(404, format!("Resource Not Found: {what}")).with_reason("notFound")
    }

    /// 409 for a create that collides with an existing entity.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message).with_reason("duplicate")
    }

    /// 400 for a missing or unresolvable required field.
    pub fn required(field: &str) -> Self {
        Self::new(400, format!("Missing required field: {field}")).with_reason("required")
    }

    /// 400 for a malformed request.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(400, message).with_reason("invalid")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "directory API error {}: {}", self.code, self.message)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

/// Errors that can occur while talking to a directory.
#[derive(Debug, Error)]
pub enum Error {
    /// Structured error from the remote service
    #[error("{0}")]
    Api(ApiError),

    /// String-only error the service returned without structured fields
    #[error("{0}")]
    Unstructured(String),

    /// A payload decoded to a different entity kind than the caller asked for
    #[error("expected {expected} entity, got {found}")]
    UnexpectedKind {
        /// Kind the caller asked for
        expected: EntityKind,
        /// Kind that was actually returned
        found: EntityKind,
    },

    /// An entity that was deleted can still be read
    #[error("{what} is still visible")]
    StillVisible {
        /// The entity being waited on
        what: String,
    },

    /// Local backend failure (not a remote condition)
    #[error("backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Status code of a structured remote error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(api) => Some(api.code),
            _ => None,
        }
    }

    /// Machine-readable reason of a structured remote error.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Error::Api(api) => api.reason.as_deref(),
            _ => None,
        }
    }

    /// Whether the remote service reported the entity as missing.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Whether the remote service reported a duplicate.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Whether a deleted entity was still readable.
    pub fn is_still_visible(&self) -> bool {
        matches!(self, Error::StillVisible { .. })
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::Api(err)
    }
}

/// Result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display_includes_reason() {
        let err = ApiError::new(403, "Quota exceeded for user").with_reason("quotaExceeded");
        assert_eq!(
            err.to_string(),
            "directory API error 403: Quota exceeded for user (quotaExceeded)"
        );
    }

    #[test]
    fn test_status_and_reason_accessors() {
        let err: Error = ApiError::required("memberKey").into();
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.reason(), Some("required"));
        assert!(!err.is_not_found());

        let err = Error::Unstructured("Service unavailable. Please try again".into());
        assert_eq!(err.status(), None);
        assert_eq!(err.reason(), None);
    }

    #[test]
    fn test_not_found_and_conflict() {
        assert!(Error::from(ApiError::not_found("group eng@x.com")).is_not_found());
        assert!(Error::from(ApiError::conflict("Entity already exists.")).is_conflict());
    }

    #[test]
    fn test_still_visible_has_no_status() {
        let err = Error::StillVisible {
            what: "group eng@x.com".into(),
        };
        assert!(err.is_still_visible());
        assert_eq!(err.status(), None);
        assert_eq!(err.to_string(), "group eng@x.com is still visible");
        assert!(!Error::Unstructured("Eventual consistency. Please try again".into()).is_still_visible());
    }
}
