//! Caller-level turn retries.
//!
//! The answering loop never retries a failed collaborator call itself. A host
//! that wants resilience replays the whole turn from `Retrieve` through
//! [`run_with_retries`], which only replays transient failures.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// What the end user sees once every attempt has failed
pub const TRY_AGAIN_MESSAGE: &str = "Failed after several attempts. Please try again later.";

/// Retry configuration for whole turns
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Wall-clock bound on a single attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Calculate delay after a failed attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// Error text that usually means the service will recover on its own.
static RETRYABLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Rate limits
        r"\b429\b",
        r"(?i)rate.?limit",
        r"(?i)too.?many.?requests",
        // Transient network errors
        r"(?i)time[ds]?.?out",
        r"(?i)connection",
        r"(?i)temporarily.?unavailable",
        // Server errors
        r"\b5(00|02|03|04)\b",
        r"(?i)overloaded",
        r"(?i)internal.?server.?error",
        r"(?i)bad.?gateway",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check if an error message looks transient
pub fn is_retryable_error(error: &str) -> bool {
    RETRYABLE_PATTERNS.iter().any(|re| re.is_match(error))
}

/// Message to show the end user for a failed turn
pub fn user_message(error: &Error) -> String {
    match error {
        Error::Exhausted { .. } => TRY_AGAIN_MESSAGE.to_string(),
        other => other.to_string(),
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the attempts run out.
///
/// `attempt` receives the 0-indexed attempt number and must start the turn
/// over from scratch each time. Non-transient errors are returned as they
/// are; transient ones end in [`Error::Exhausted`] after the last attempt.
pub async fn run_with_retries<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut n = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = match config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt(n)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(limit)),
            },
            None => attempt(n).await,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        n += 1;
        if n >= max_attempts {
            tracing::warn!(attempts = n, error = %error, "turn failed on every attempt");
            return Err(Error::Exhausted {
                attempts: n,
                last: Box::new(error),
            });
        }

        let delay = config.delay_for_attempt(n - 1);
        tracing::warn!(
            "Turn failed (attempt {}/{}): {}. Retrying in {:?}...",
            n,
            max_attempts,
            error,
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
