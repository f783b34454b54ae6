use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// Configuration for query behavior.
///
/// This controls how queries cache data, when they consider it stale, and how
/// failed loads are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// Observers attaching to fresh data use it without refetching. Stale data is
    /// shown while a refetch runs.
    #[serde(with = "millis")]
    pub stale_time: Duration,

    /// How long unobserved entries are retained before [`QueryClient::gc`] drops them.
    ///
    /// [`QueryClient::gc`]: super::QueryClient::gc
    #[serde(with = "millis")]
    pub cache_time: Duration,

    /// Retry policy applied when a fetch does not specify its own.
    pub retry: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0),      // immediately stale
            cache_time: Duration::from_secs(5 * 60), // 5 minutes
            retry: RetryPolicy::default(),
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and cache times.
    #[must_use]
    pub const fn new(stale_time: Duration, cache_time: Duration, retry: RetryPolicy) -> Self {
        Self {
            stale_time,
            cache_time,
            retry,
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.stale_time, Duration::from_secs(0));
        assert_eq!(config.cache_time, Duration::from_secs(5 * 60));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_new_config() {
        let config = QueryConfig::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
            RetryPolicy::none(),
        );
        assert_eq!(config.stale_time, Duration::from_secs(30));
        assert_eq!(config.cache_time, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 0);
    }

    #[test]
    fn test_durations_are_millis_in_toml() {
        let config: QueryConfig =
            toml::from_str("stale_time = 1500\ncache_time = 60000\n").expect("parse config");
        assert_eq!(config.stale_time, Duration::from_millis(1500));
        assert_eq!(config.cache_time, Duration::from_secs(60));
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
