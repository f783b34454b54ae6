//! Retry with backoff for failed loads.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::millis;
use super::{Loader, QueryError};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// `base * 2^retry`, capped at `max`.
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "millis")]
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(max, |d| d.min(max))
            }
        }
    }
}

/// How many times a transient failure is retried, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed {
                delay: Duration::ZERO,
            },
        }
    }

    #[must_use]
    pub const fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
        }
    }
}

/// Runs `loader` until it succeeds, fails terminally, or retries run out.
///
/// Any failure that is returned is a [`QueryError::Terminal`].
pub(crate) async fn run_with_retry<V>(
    loader: &Loader<V>,
    policy: RetryPolicy,
    key: &str,
) -> Result<V, QueryError> {
    let mut attempts = 0u32;
    loop {
        attempts = attempts.saturating_add(1);
        match loader().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retries_used = attempts.saturating_sub(1);
                if !err.is_transient() || retries_used >= policy.max_retries {
                    return Err(QueryError::Terminal {
                        attempts,
                        message: err.to_string(),
                    });
                }
                let delay = policy.backoff.delay(retries_used);
                debug!(%key, attempts, ?delay, error = %err, "retrying fetch");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
