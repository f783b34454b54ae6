use std::time::Duration;

use tokio::time::Instant;

use crate::key::QueryKey;

use super::QueryError;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Created by a subscriber, never fetched.
    Idle,
    Pending,
    Success,
    Error,
}

/// A cached entry with status, last value, last error and staleness information.
///
/// After a failed refetch the entry keeps the previous value next to the error, so
/// consumers can keep showing it.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: QueryKey,
    pub status: FetchStatus,
    pub value: Option<T>,
    pub error: Option<QueryError>,
    pub last_fetched_at: Option<Instant>,
    pub is_stale: bool,
}

impl<T> CacheEntry<T> {
    /// Creates an idle entry with no data.
    pub const fn new(key: QueryKey) -> Self {
        Self {
            key,
            status: FetchStatus::Idle,
            value: None,
            error: None,
            last_fetched_at: None,
            is_stale: false,
        }
    }

    /// Checks if this entry is stale based on the given stale time.
    pub fn check_staleness(&mut self, stale_time: Duration) -> bool {
        match self.last_fetched_at {
            Some(at) if at.elapsed() >= stale_time => self.is_stale = true,
            None => self.is_stale = true,
            _ => {}
        }
        self.is_stale
    }

    pub const fn mark_stale(&mut self) {
        self.is_stale = true;
    }

    pub const fn mark_pending(&mut self) {
        self.status = FetchStatus::Pending;
    }

    /// Stores fresh data, resetting timestamp, error and staleness.
    pub fn update(&mut self, data: T) {
        self.status = FetchStatus::Success;
        self.value = Some(data);
        self.error = None;
        self.last_fetched_at = Some(Instant::now());
        self.is_stale = false;
    }

    /// Records a failure while keeping the last good value.
    pub fn fail(&mut self, error: QueryError) {
        self.status = FetchStatus::Error;
        self.error = Some(error);
    }

    /// Returns `true` once the entry has produced a value or an error.
    pub fn has_settled(&self) -> bool {
        self.value.is_some() || self.error.is_some()
    }

    /// Checks if this entry should be garbage collected based on cache time.
    pub fn should_gc(&self, cache_time: Duration) -> bool {
        self.last_fetched_at
            .is_none_or(|at| at.elapsed() > cache_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    #[test]
    fn test_new_entry() {
        let entry = CacheEntry::<i32>::new(query_key!["model", "m1"]);
        assert_eq!(entry.status, FetchStatus::Idle);
        assert!(entry.value.is_none());
        assert!(!entry.is_stale);
        assert!(!entry.has_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_staleness() {
        let mut entry = CacheEntry::new(query_key!["k"]);
        entry.update(42);
        assert!(!entry.check_staleness(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(entry.check_staleness(Duration::from_secs(1)));
        assert!(entry.is_stale);
    }

    #[test]
    fn test_never_fetched_entry_is_stale() {
        let mut entry = CacheEntry::<i32>::new(query_key!["k"]);
        assert!(entry.check_staleness(Duration::from_secs(60)));
    }

    #[test]
    fn test_failure_keeps_last_value() {
        let mut entry = CacheEntry::new(query_key!["k"]);
        entry.update(42);
        entry.mark_stale();

        entry.fail(QueryError::FetchError("down".into()));
        assert_eq!(entry.status, FetchStatus::Error);
        assert_eq!(entry.value, Some(42));
        assert!(entry.error.is_some());

        entry.update(100);
        assert_eq!(entry.value, Some(100));
        assert!(entry.error.is_none());
        assert!(!entry.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_gc() {
        let mut entry = CacheEntry::new(query_key!["k"]);
        entry.update(1);
        assert!(!entry.should_gc(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(entry.should_gc(Duration::from_secs(10)));
    }
}
