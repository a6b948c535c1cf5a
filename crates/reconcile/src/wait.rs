//! Polling for read-after-write visibility.

use crate::classify::RetryOptions;
use crate::error::{ReconcileError, Result};
use crate::retry::RetryPolicy;
use log::debug;

/// Bridges the directory's read-after-write lag for top-level entities.
pub struct EventualConsistencyWait<'a> {
    policy: &'a RetryPolicy,
}

impl<'a> EventualConsistencyWait<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy }
    }

    /// Poll `fetch` until it stops returning 404.
    pub fn wait_until_visible<T, F>(&self, what: &str, fetch: F) -> Result<T>
    where
        F: FnMut() -> directory::Result<T>,
    {
        debug!("Waiting for {what} to become visible");
        self.policy
            .run(format!("wait for {what}"), RetryOptions::not_found(), fetch)
            .map_err(|source| {
                if source.is_not_found() {
                    ReconcileError::NotVisible {
                        what: what.to_string(),
                        source,
                    }
                } else {
                    ReconcileError::remote(format!("wait for {what}"), source)
                }
            })
    }

    /// Poll `fetch` until it returns 404.
    pub fn wait_until_gone<T, F>(&self, what: &str, mut fetch: F) -> Result<()>
    where
        F: FnMut() -> directory::Result<T>,
    {
        debug!("Waiting for {what} to disappear");
        let poll = || match fetch() {
            Ok(_) => Err(directory::Error::StillVisible {
                what: what.to_string(),
            }),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        };
        self.policy
            .run(format!("wait for {what} removal"), RetryOptions::default(), poll)
            .map_err(|source| match source {
                directory::Error::StillVisible { .. } => ReconcileError::StillPresent {
                    what: what.to_string(),
                },
                source => ReconcileError::remote(format!("wait for {what} removal"), source),
            })
    }
}
