//! Classification of remote failures.
//!
//! This is the only place that inspects error strings. The directory service
//! sometimes reports transient failures as bare strings, or wraps them in a
//! success-level response, so a handful of known messages have to be matched
//! textually. Everything else is decided on status code and reason.

use directory::Error;
use std::fmt;

/// Messages the service emits for failures that resolve on their own.
const KNOWN_FLAKY_MESSAGES: &[&str] = &[
    "Service unavailable. Please try again",
    "Eventual consistency. Please try again",
];

/// Prefix of the spurious bad-request failure; only flaky with an embedded 400.
const BAD_REQUEST_PREFIX: &str = "Invalid Input: Bad request";
const EMBEDDED_400: &[&str] = &["\"code\":400", "\"code\": 400"];

/// Category of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 5xx
    TransientServer,
    /// 429, 401 or reason "quotaExceeded"
    QuotaExceeded,
    /// 404
    NotFound,
    /// 409
    Conflict,
    /// 400 or reason "invalid"
    InvalidRequest,
    /// One of the known transient messages, regardless of status
    KnownFlaky,
    /// A deleted entity has not disappeared yet
    StillVisible,
    /// Anything else
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientServer => "server",
            Self::QuotaExceeded => "quota",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::InvalidRequest => "invalid-request",
            Self::KnownFlaky => "known-flaky",
            Self::StillVisible => "still-visible",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Classify a directory error.
pub fn classify_error(err: &Error) -> ErrorClass {
    if err.is_still_visible() {
        return ErrorClass::StillVisible;
    }
    if is_known_flaky(&err.to_string()) {
        return ErrorClass::KnownFlaky;
    }
    let Error::Api(api) = err else {
        return ErrorClass::Other;
    };
    if api.reason.as_deref() == Some("quotaExceeded") {
        return ErrorClass::QuotaExceeded;
    }
    match api.code {
        500..=599 => ErrorClass::TransientServer,
        401 | 429 => ErrorClass::QuotaExceeded,
        404 => ErrorClass::NotFound,
        409 => ErrorClass::Conflict,
        400 => ErrorClass::InvalidRequest,
        _ if api.reason.as_deref() == Some("invalid") => ErrorClass::InvalidRequest,
        _ => ErrorClass::Other,
    }
}

fn is_known_flaky(message: &str) -> bool {
    if KNOWN_FLAKY_MESSAGES.iter().any(|m| message.contains(m)) {
        return true;
    }
    message.contains(BAD_REQUEST_PREFIX) && EMBEDDED_400.iter().any(|c| message.contains(c))
}

/// Which conditionally-retryable classes a caller opts into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOptions {
    /// Treat 404 as eventual consistency
    pub retry_not_found: bool,
    /// Treat 409 as transient
    pub retry_conflict: bool,
    /// Treat 400 / "invalid" as transient
    pub retry_invalid: bool,
}

impl RetryOptions {
    /// Options for reads right after a create.
    pub fn not_found() -> Self {
        Self {
            retry_not_found: true,
            ..Self::default()
        }
    }

    pub fn with_conflict(mut self) -> Self {
        self.retry_conflict = true;
        self
    }

    pub fn with_invalid(mut self) -> Self {
        self.retry_invalid = true;
        self
    }
}

/// What a retry loop should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off and try again
    Retry(ErrorClass),
    /// Back off and try again; the entity is expected to appear
    RetryUntilFound,
    /// Give up and return the error
    Fatal(ErrorClass),
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Decide whether `err` is worth retrying under `options`.
pub fn decide(err: &Error, options: RetryOptions) -> RetryDecision {
    let class = classify_error(err);
    match class {
        ErrorClass::TransientServer
        | ErrorClass::QuotaExceeded
        | ErrorClass::KnownFlaky
        | ErrorClass::StillVisible => RetryDecision::Retry(class),
        ErrorClass::NotFound if options.retry_not_found => RetryDecision::RetryUntilFound,
        ErrorClass::Conflict if options.retry_conflict => RetryDecision::Retry(class),
        ErrorClass::InvalidRequest if options.retry_invalid => RetryDecision::Retry(class),
        _ => RetryDecision::Fatal(class),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directory::ApiError;

    fn api(code: u16) -> Error {
        ApiError::new(code, "boom").into()
    }

    fn unstructured(message: &str) -> Error {
        Error::Unstructured(message.to_string())
    }

    #[test]
    fn test_server_errors_are_transient() {
        for code in [500, 502, 503, 504] {
            assert_eq!(classify_error(&api(code)), ErrorClass::TransientServer);
        }
    }

    #[test]
    fn test_quota_by_status_and_reason() {
        assert_eq!(classify_error(&api(429)), ErrorClass::QuotaExceeded);
        assert_eq!(classify_error(&api(401)), ErrorClass::QuotaExceeded);
        let reason: Error = ApiError::new(403, "Quota exceeded for quota metric")
            .with_reason("quotaExceeded")
            .into();
        assert_eq!(classify_error(&reason), ErrorClass::QuotaExceeded);
    }

    #[test]
    fn test_plain_403_is_other() {
        assert_eq!(classify_error(&api(403)), ErrorClass::Other);
    }

    #[test]
    fn test_invalid_by_status_and_reason() {
        assert_eq!(classify_error(&api(400)), ErrorClass::InvalidRequest);
        let reason: Error = ApiError::new(412, "bad").with_reason("invalid").into();
        assert_eq!(classify_error(&reason), ErrorClass::InvalidRequest);
    }

    #[test]
    fn test_service_unavailable_string() {
        let err = unstructured("googleapi: Service unavailable. Please try again");
        assert_eq!(classify_error(&err), ErrorClass::KnownFlaky);
    }

    #[test]
    fn test_eventual_consistency_string() {
        let err = unstructured("Eventual consistency. Please try again");
        assert_eq!(classify_error(&err), ErrorClass::KnownFlaky);
    }

    #[test]
    fn test_bad_request_string_needs_embedded_400() {
        let flaky = unstructured(
            r#"Invalid Input: Bad request for "eng@x.com" {"error":{"code":400}}"#,
        );
        assert_eq!(classify_error(&flaky), ErrorClass::KnownFlaky);

        let spaced = unstructured(r#"Invalid Input: Bad request {"code": 400}"#);
        assert_eq!(classify_error(&spaced), ErrorClass::KnownFlaky);

        let bare = unstructured("Invalid Input: Bad request for \"eng@x.com\"");
        assert_eq!(classify_error(&bare), ErrorClass::Other);
    }

    #[test]
    fn test_known_message_wins_over_status() {
        let err: Error = ApiError::new(200, "Service unavailable. Please try again").into();
        assert_eq!(classify_error(&err), ErrorClass::KnownFlaky);
    }

    #[test]
    fn test_still_visible_is_retried() {
        let err = Error::StillVisible {
            what: "group eng@x.com".into(),
        };
        assert_eq!(classify_error(&err), ErrorClass::StillVisible);
        assert_eq!(
            decide(&err, RetryOptions::default()),
            RetryDecision::Retry(ErrorClass::StillVisible)
        );
    }

    #[test]
    fn test_local_errors_are_other() {
        let err = Error::Backend("no parent".into());
        assert_eq!(classify_error(&err), ErrorClass::Other);
    }

    #[test]
    fn test_decide_respects_options() {
        let none = RetryOptions::default();
        assert_eq!(decide(&api(503), none), RetryDecision::Retry(ErrorClass::TransientServer));
        assert_eq!(decide(&api(404), none), RetryDecision::Fatal(ErrorClass::NotFound));
        assert_eq!(decide(&api(409), none), RetryDecision::Fatal(ErrorClass::Conflict));
        assert_eq!(decide(&api(400), none), RetryDecision::Fatal(ErrorClass::InvalidRequest));

        assert_eq!(
            decide(&api(404), RetryOptions::not_found()),
            RetryDecision::RetryUntilFound
        );
        assert!(decide(&api(409), none.with_conflict()).is_retry());
        assert!(decide(&api(400), none.with_invalid()).is_retry());
        assert!(!decide(&api(403), none.with_conflict().with_invalid()).is_retry());
    }
}
