//! Retry logic with exponential backoff, jitter and a deadline.

use crate::classify::{RetryDecision, RetryOptions, decide};
use crate::clock::{Clock, SystemClock};
use crate::config::RetryConfig;
use directory::{Error, Result};
use log::debug;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// A remote call that can be attempted more than once.
pub trait Operation {
    type Output;

    /// Short description used in logs and error context.
    fn describe(&self) -> String;

    /// Make one attempt.
    fn execute(&mut self) -> Result<Self::Output>;
}

/// [`Operation`] built from a description and a closure.
pub struct FnOperation<F> {
    description: String,
    f: F,
}

impl<T, F> Operation for FnOperation<F>
where
    F: FnMut() -> Result<T>,
{
    type Output = T;

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn execute(&mut self) -> Result<T> {
        (self.f)()
    }
}

/// Build an [`Operation`] from a closure.
pub fn op<T, F>(description: impl Into<String>, f: F) -> FnOperation<F>
where
    F: FnMut() -> Result<T>,
{
    FnOperation {
        description: description.into(),
        f,
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback: Send + Sync {
    /// Called before sleeping ahead of the next attempt.
    ///
    /// # Arguments
    /// * `attempt` - Number of the attempt that just failed (1-indexed)
    /// * `description` - What is being retried
    /// * `error` - The error that triggered the retry
    /// * `delay` - Sleep before the next attempt
    fn on_retry(&self, attempt: u32, description: &str, error: &Error, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _description: &str, _error: &Error, _delay: Duration) {}
}

/// Runs operations until they succeed, fail fatally, or run out of time.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
    callback: Arc<dyn RetryCallback>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            callback: Arc::new(NoCallback),
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receive a notification before every backoff sleep.
    pub fn with_callback(mut self, callback: Arc<dyn RetryCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `operation` until it succeeds or a retry is no longer allowed.
    ///
    /// A fatal classification, or a failure once the deadline has passed,
    /// returns the operation's own error unchanged.
    pub fn execute<O: Operation>(&self, operation: &mut O, options: RetryOptions) -> Result<O::Output> {
        let description = operation.describe();
        let deadline = self.clock.now() + self.config.deadline;
        let mut attempt: u32 = 0;

        loop {
            let err = match operation.execute() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            let decision = decide(&err, options);
            if let RetryDecision::Fatal(class) = decision {
                debug!("{description}: {class} error is not retryable: {err}");
                return Err(err);
            }

            let now = self.clock.now();
            if now >= deadline {
                debug!(
                    "{description}: giving up after {attempt} attempt(s), deadline of {:?} passed: {err}",
                    self.config.deadline
                );
                return Err(err);
            }

            let delay = self
                .config
                .delay_for_attempt(attempt - 1)
                .saturating_add(self.jitter())
                .min(deadline - now);
            debug!("{description}: attempt {attempt} failed ({decision:?}), retrying in {delay:?}: {err}");
            self.callback.on_retry(attempt, &description, &err, delay);
            self.clock.sleep(delay);
        }
    }

    /// Shorthand for executing a closure.
    pub fn run<T, F>(&self, description: impl Into<String>, options: RetryOptions, f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.execute(&mut op(description, f), options)
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.config.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}
