use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::key::QueryKey;

use super::cache::{CacheEntry, FetchStatus};
use super::config::QueryConfig;
use super::retry::{RetryPolicy, run_with_retry};
use super::state::QueryResult;
use super::{CacheValue, FetchOptions, Loader, QueryError, Readiness};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, QueryError>>>;

/// Outcome of starting a fetch on a slot.
pub(crate) enum Started<V> {
    Cached(V),
    InFlight(SharedFetch<V>),
}

struct SlotState<V> {
    entry: CacheEntry<V>,
    loader: Option<Loader<V>>,
    retry: RetryPolicy,
    in_flight: Option<SharedFetch<V>>,
    subscribers: usize,
    /// Set when an invalidation lands while a fetch is running.
    invalidated_in_flight: bool,
    /// Set when the slot is removed from the map; a retired slot never starts a fetch.
    retired: bool,
}

/// One cache entry plus everything needed to refetch it.
pub(crate) struct Slot<V> {
    key: QueryKey,
    state: Mutex<SlotState<V>>,
    tx: watch::Sender<QueryResult<V>>,
}

enum Invalidation {
    Refetch,
    Deferred,
    Keep,
    Drop,
}

/// Type-erased view of a [`Slot`], so invalidation can walk entries of any value type.
trait ErasedSlot: Send + Sync + 'static {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn subscriber_count(&self) -> usize;
    fn add_subscriber(&self);
    fn remove_subscriber(&self);
    fn invalidate(&self) -> Invalidation;
    fn refetch(self: Arc<Self>);
    /// Retires the slot if it has no subscribers and no fetch running.
    fn retire_if_unused(&self) -> bool;
    /// Retires the slot if it is unused and older than `cache_time`.
    fn retire_if_expired(&self, cache_time: Duration) -> bool;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: CacheValue> Slot<V> {
    fn new(key: QueryKey, retry: RetryPolicy) -> Self {
        let entry = CacheEntry::new(key.clone());
        let (tx, _) = watch::channel(QueryResult::from(&entry));
        Self {
            key,
            state: Mutex::new(SlotState {
                entry,
                loader: None,
                retry,
                in_flight: None,
                subscribers: 0,
                invalidated_in_flight: false,
                retired: false,
            }),
            tx,
        }
    }

    fn publish(&self, state: &SlotState<V>) {
        self.tx.send_replace(QueryResult::from(&state.entry));
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<QueryResult<V>> {
        self.tx.subscribe()
    }

    /// Starts a fetch, joins the one in flight, or returns fresh cached data.
    ///
    /// The first loader and retry policy seen by the slot are kept for later refetches.
    /// Returns `None` if the slot was retired; the caller looks the key up again.
    fn start(
        self: &Arc<Self>,
        loader: Option<Loader<V>>,
        retry: Option<RetryPolicy>,
        stale_time: Option<Duration>,
    ) -> Result<Option<Started<V>>, QueryError> {
        let mut state = lock(&self.state);

        if state.retired {
            return Ok(None);
        }

        if let Some(in_flight) = &state.in_flight {
            debug!(key = %self.key, "joining in-flight fetch");
            return Ok(Some(Started::InFlight(in_flight.clone())));
        }

        if let Some(stale_time) = stale_time {
            if !state.entry.check_staleness(stale_time) {
                if let Some(value) = &state.entry.value {
                    debug!(key = %self.key, "serving fresh cached value");
                    return Ok(Some(Started::Cached(value.clone())));
                }
            }
        }

        if state.loader.is_none() {
            state.loader = loader;
            if let Some(retry) = retry {
                state.retry = retry;
            }
        }
        let Some(loader) = state.loader.clone() else {
            return Err(QueryError::NotReady(format!("no loader registered for {}", self.key)));
        };

        let policy = state.retry;
        let slot = Arc::clone(self);
        let key = self.key.to_string();
        debug!(%key, "starting fetch");

        // The load runs on its own task so a dropped caller never cancels it.
        let handle = tokio::spawn(async move {
            let result = run_with_retry(&loader, policy, &key).await;
            slot.settle(&result);
            result
        });
        let fetch = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(QueryError::FetchError(format!("fetch task failed: {e}"))))
        }
        .boxed()
        .shared();

        state.in_flight = Some(fetch.clone());
        state.entry.mark_pending();
        self.publish(&state);
        Ok(Some(Started::InFlight(fetch)))
    }

    fn settle(self: &Arc<Self>, result: &Result<V, QueryError>) {
        let refetch = {
            let mut state = lock(&self.state);
            state.in_flight = None;
            match result {
                Ok(value) => state.entry.update(value.clone()),
                Err(error) => {
                    warn!(key = %self.key, %error, "fetch failed");
                    state.entry.fail(error.clone());
                }
            }
            let invalidated = std::mem::take(&mut state.invalidated_in_flight);
            if invalidated {
                state.entry.mark_stale();
            }
            self.publish(&state);
            invalidated && state.subscribers > 0
        };

        if refetch {
            debug!(key = %self.key, "refetching after invalidation during fetch");
            if let Err(error) = self.start(None, None, None) {
                warn!(key = %self.key, %error, "refetch could not start");
            }
        }
    }

    fn entry(&self) -> CacheEntry<V> {
        lock(&self.state).entry.clone()
    }

    /// Returns `false` if the slot was retired and the value went nowhere.
    fn set_data(&self, value: V) -> bool {
        let mut state = lock(&self.state);
        if state.retired {
            return false;
        }
        state.entry.update(value);
        self.publish(&state);
        true
    }
}

impl<V: CacheValue> ErasedSlot for Slot<V> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers
    }

    fn add_subscriber(&self) {
        let mut state = lock(&self.state);
        state.subscribers = state.subscribers.saturating_add(1);
    }

    fn remove_subscriber(&self) {
        let mut state = lock(&self.state);
        state.subscribers = state.subscribers.saturating_sub(1);
    }

    fn invalidate(&self) -> Invalidation {
        let mut state = lock(&self.state);
        state.entry.mark_stale();
        self.publish(&state);

        if state.in_flight.is_some() {
            state.invalidated_in_flight = true;
            if state.subscribers > 0 {
                Invalidation::Deferred
            } else {
                Invalidation::Keep
            }
        } else if state.subscribers == 0 {
            Invalidation::Drop
        } else if state.loader.is_some() {
            Invalidation::Refetch
        } else {
            Invalidation::Keep
        }
    }

    fn refetch(self: Arc<Self>) {
        if let Err(error) = self.start(None, None, None) {
            warn!(key = %self.key, %error, "refetch could not start");
        }
    }

    fn retire_if_unused(&self) -> bool {
        let mut state = lock(&self.state);
        if state.subscribers == 0 && state.in_flight.is_none() {
            state.retired = true;
        }
        state.retired
    }

    fn retire_if_expired(&self, cache_time: Duration) -> bool {
        let mut state = lock(&self.state);
        if state.subscribers == 0 && state.in_flight.is_none() && state.entry.should_gc(cache_time) {
            state.retired = true;
        }
        state.retired
    }
}

struct Inner {
    entries: DashMap<QueryKey, Arc<dyn ErasedSlot>>,
    config: QueryConfig,
    next_subscription: AtomicU64,
}

/// Keys touched by [`QueryClient::invalidate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Entries with active subscribers; a refetch was started or queued.
    pub refetched: Vec<QueryKey>,
    /// Entries without subscribers that were removed.
    pub dropped: Vec<QueryKey>,
    /// Entries marked stale but kept (a fetch was running, or nothing to refetch with).
    pub kept: Vec<QueryKey>,
}

/// A client owning the query cache.
///
/// The `QueryClient` is the central state manager for queries. It handles:
/// - Caching query results per key
/// - Deduplicating concurrent fetches of the same key
/// - Invalidating entries by key prefix and refetching the observed ones
///
/// Cloning is cheap; clones share the same cache.
///
/// # Example
///
/// ```rust
/// use studio_cache::query::{QueryClient, QueryConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let config = QueryConfig::new(
///     Duration::from_secs(30),  // stale_time
///     Duration::from_secs(300), // cache_time
///     RetryPolicy::default(),
/// );
///
/// let client = QueryClient::with_config(config);
/// assert!(client.is_empty());
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.inner.entries.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                config,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Gets the query configuration.
    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn downcast<V: CacheValue>(
        erased: Arc<dyn ErasedSlot>,
        key: &QueryKey,
    ) -> Result<Arc<Slot<V>>, QueryError> {
        erased
            .as_any()
            .downcast::<Slot<V>>()
            .map_err(|_| QueryError::TypeMismatch {
                key: key.to_string(),
            })
    }

    fn slot<V: CacheValue>(&self, key: &QueryKey) -> Result<Option<Arc<Slot<V>>>, QueryError> {
        let Some(erased) = self.inner.entries.get(key).map(|e| Arc::clone(e.value())) else {
            return Ok(None);
        };
        Self::downcast(erased, key).map(Some)
    }

    fn slot_or_insert<V: CacheValue>(
        &self,
        key: &QueryKey,
        subscribe: bool,
    ) -> Result<Arc<Slot<V>>, QueryError> {
        let retry = self.inner.config.retry;
        let erased = {
            let entry = self.inner.entries.entry(key.clone()).or_insert_with(|| {
                Arc::new(Slot::<V>::new(key.clone(), retry)) as Arc<dyn ErasedSlot>
            });
            let erased = Arc::clone(entry.value());
            // Registered under the shard lock so invalidation never drops a slot
            // that is gaining a subscriber.
            if subscribe {
                erased.add_subscriber();
            }
            erased
        };
        Self::downcast(erased.clone(), key).inspect_err(|_| {
            if subscribe {
                erased.remove_subscriber();
            }
        })
    }

    /// Returns the entry for `key`, if it has been fetched or seeded and holds
    /// values of type `V`.
    ///
    /// A key that is only subscribed to, with no fetch started yet, reads as `None`.
    pub fn get<V: CacheValue>(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
        match self.slot::<V>(key) {
            Ok(slot) => slot
                .map(|s| s.entry())
                .filter(|entry| entry.status != FetchStatus::Idle || entry.value.is_some()),
            Err(error) => {
                debug!(%key, %error, "cache read with mismatched type");
                None
            }
        }
    }

    /// Fetches `key` through the cache.
    ///
    /// Callers arriving while a fetch for `key` is in flight share its result, so
    /// `loader` runs at most once at a time per key. Fresh data (younger than
    /// [`QueryConfig::stale_time`]) is returned without fetching. A gated
    /// [`Readiness`] returns [`QueryError::NotReady`] or [`QueryError::Disabled`]
    /// without touching the cache.
    pub async fn fetch<V: CacheValue>(
        &self,
        key: &QueryKey,
        loader: Loader<V>,
        options: FetchOptions,
    ) -> Result<V, QueryError> {
        match self.start_fetch(key, loader, options)? {
            Started::Cached(value) => Ok(value),
            Started::InFlight(fetch) => fetch.await,
        }
    }

    pub(crate) fn start_fetch<V: CacheValue>(
        &self,
        key: &QueryKey,
        loader: Loader<V>,
        options: FetchOptions,
    ) -> Result<Started<V>, QueryError> {
        match options.readiness {
            Readiness::Ready => {}
            Readiness::NotReady(reason) => {
                debug!(%key, %reason, "fetch skipped, query not ready");
                return Err(QueryError::NotReady(reason));
            }
            Readiness::Disabled => {
                debug!(%key, "fetch skipped, query disabled");
                return Err(QueryError::Disabled);
            }
        }
        loop {
            let slot = self.slot_or_insert::<V>(key, false)?;
            let started = slot.start(
                Some(loader.clone()),
                options.retry,
                Some(self.inner.config.stale_time),
            )?;
            if let Some(started) = started {
                return Ok(started);
            }
            debug!(%key, "slot retired under us, retrying lookup");
        }
    }

    /// Refetches `key` with its remembered loader, ignoring freshness.
    pub async fn refetch<V: CacheValue>(&self, key: &QueryKey) -> Result<V, QueryError> {
        let Some(slot) = self.slot::<V>(key)? else {
            return Err(QueryError::NotReady(format!("no cache entry for {key}")));
        };
        match slot.start(None, None, None)? {
            Some(Started::Cached(value)) => Ok(value),
            Some(Started::InFlight(fetch)) => fetch.await,
            None => Err(QueryError::NotReady(format!("no cache entry for {key}"))),
        }
    }

    /// Seeds or overwrites the value for `key` and notifies subscribers.
    pub fn set_data<V: CacheValue>(&self, key: &QueryKey, value: V) -> Result<(), QueryError> {
        while !self.slot_or_insert::<V>(key, false)?.set_data(value.clone()) {
            debug!(%key, "slot retired under us, retrying lookup");
        }
        Ok(())
    }

    /// Marks every entry under `prefix` stale.
    ///
    /// Observed entries are refetched with the loader they were created with; a
    /// running fetch is followed by one more. Unobserved entries are dropped and
    /// load lazily on next access.
    pub fn invalidate(&self, prefix: &QueryKey) -> InvalidationReport {
        let matching: Vec<(QueryKey, Arc<dyn ErasedSlot>)> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut report = InvalidationReport::default();
        for (key, slot) in matching {
            match slot.invalidate() {
                Invalidation::Refetch => {
                    Arc::clone(&slot).refetch();
                    report.refetched.push(key);
                }
                Invalidation::Deferred => report.refetched.push(key),
                Invalidation::Keep => report.kept.push(key),
                Invalidation::Drop => {
                    // Re-checked under the slot lock: a fetch may have started since.
                    let removed = self.inner.entries.remove_if(&key, |_, current| {
                        Arc::ptr_eq(current, &slot) && current.retire_if_unused()
                    });
                    if removed.is_some() {
                        report.dropped.push(key);
                    } else {
                        report.kept.push(key);
                    }
                }
            }
        }

        debug!(
            %prefix,
            refetched = report.refetched.len(),
            dropped = report.dropped.len(),
            kept = report.kept.len(),
            "invalidated"
        );
        report
    }

    /// Removes the entry for `key` regardless of subscribers.
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Drops unobserved entries older than [`QueryConfig::cache_time`].
    ///
    /// Returns the number of entries removed.
    pub fn gc(&self) -> usize {
        let cache_time = self.inner.config.cache_time;
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, slot| !slot.retire_if_expired(cache_time));
        before.saturating_sub(self.inner.entries.len())
    }

    /// Number of active subscribers on `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.inner
            .entries
            .get(key)
            .map_or(0, |e| e.value().subscriber_count())
    }

    pub(crate) fn attach<V: CacheValue>(
        &self,
        key: &QueryKey,
    ) -> Result<(SubscriptionGuard, watch::Receiver<QueryResult<V>>), QueryError> {
        let slot = self.slot_or_insert::<V>(key, true)?;
        let rx = slot.receiver();
        let guard = SubscriptionGuard {
            slot: slot as Arc<dyn ErasedSlot>,
            token: None,
            id: self.inner.next_subscription.fetch_add(1, Ordering::Relaxed),
        };
        Ok((guard, rx))
    }

    /// Calls `callback` with a snapshot every time the entry for `key` changes.
    ///
    /// Rapid successive changes may be coalesced; the callback always sees the
    /// latest state. The subscription lasts until the guard is dropped. Requires a
    /// running tokio runtime.
    pub fn subscribe<V, F>(&self, key: &QueryKey, callback: F) -> Result<SubscriptionGuard, QueryError>
    where
        V: CacheValue,
        F: Fn(&QueryResult<V>) + Send + Sync + 'static,
    {
        let (mut guard, mut rx) = self.attach::<V>(key)?;
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        callback(&snapshot);
                    }
                }
            }
        });

        guard.token = Some(token);
        Ok(guard)
    }
}

/// Keeps a cache subscription alive; dropping it unsubscribes.
pub struct SubscriptionGuard {
    slot: Arc<dyn ErasedSlot>,
    token: Option<CancellationToken>,
    id: u64,
}

impl SubscriptionGuard {
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Unsubscribes now. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.slot.remove_subscriber();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::query::{FetchStatus, loader};
    use crate::query_key;

    fn counted(value: i32) -> (Loader<i32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let loader = loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(value) }
        });
        (loader, calls)
    }

    #[test]
    fn test_query_client_new() {
        let client = QueryClient::new();
        assert!(client.is_empty());
        assert_eq!(client.config().stale_time, Duration::from_secs(0));
    }

    #[tokio::test]
    async fn test_fetch_populates_entry() {
        let client = QueryClient::new();
        let key = query_key!["model", "m1"];
        let (loader, calls) = counted(42);

        let value = client.fetch(&key, loader, FetchOptions::new()).await;
        assert_eq!(value, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = client.get::<i32>(&key).expect("entry exists");
        assert_eq!(entry.value, Some(42));
        assert_eq!(entry.status, FetchStatus::Success);
        assert!(entry.last_fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_gated_fetch_creates_no_entry() {
        let client = QueryClient::new();
        let key = query_key!["model", None::<String>];
        let (loader, calls) = counted(1);

        let result = client
            .fetch(
                &key,
                loader.clone(),
                FetchOptions::new().readiness(Readiness::NotReady("id".into())),
            )
            .await;
        assert_eq!(result, Err(QueryError::NotReady("id".into())));

        let result = client
            .fetch(&key, loader, FetchOptions::new().enabled(false))
            .await;
        assert_eq!(result, Err(QueryError::Disabled));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(client.get::<i32>(&key).is_none());
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_reported() {
        let client = QueryClient::new();
        let key = query_key!["data"];
        client.set_data(&key, 42_i32).expect("seed");

        let result = client
            .fetch(
                &key,
                loader(|| async { Ok("text".to_string()) }),
                FetchOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(QueryError::TypeMismatch { .. })));
        assert!(client.get::<String>(&key).is_none());
        assert_eq!(client.get::<i32>(&key).and_then(|e| e.value), Some(42));
    }

    #[tokio::test]
    async fn test_fresh_data_is_served_from_cache() {
        let config = QueryConfig::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
            RetryPolicy::none(),
        );
        let client = QueryClient::with_config(config);
        let key = query_key!["prototype", "p1"];
        let (loader, calls) = counted(5);

        client.fetch(&key, loader.clone(), FetchOptions::new()).await.expect("first");
        client.fetch(&key, loader, FetchOptions::new()).await.expect("second");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_drops_unobserved_entries() {
        let client = QueryClient::new();
        let (loader, _) = counted(1);
        for id in ["p1", "p2"] {
            client
                .fetch(&query_key!["children", id], loader.clone(), FetchOptions::new())
                .await
                .expect("fetch");
        }

        let report = client.invalidate(&query_key!["children", "p1"]);
        assert_eq!(report.dropped, vec![query_key!["children", "p1"]]);
        assert!(client.get::<i32>(&query_key!["children", "p1"]).is_none());
        assert!(client.get::<i32>(&query_key!["children", "p2"]).is_some());
    }

    #[tokio::test]
    async fn test_subscriber_count_follows_guards() {
        let client = QueryClient::new();
        let key = query_key!["user", "self"];

        let first = client.subscribe::<i32, _>(&key, |_| {}).expect("subscribe");
        let second = client.subscribe::<i32, _>(&key, |_| {}).expect("subscribe");
        assert_eq!(client.subscriber_count(&key), 2);

        first.unsubscribe();
        assert_eq!(client.subscriber_count(&key), 1);
        drop(second);
        assert_eq!(client.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn test_subscribed_but_unfetched_key_reads_as_none() {
        let client = QueryClient::new();
        let key = query_key!["x"];
        let _guard = client.subscribe::<u32, _>(&key, |_| {}).expect("subscribe");

        assert!(client.get::<u32>(&key).is_none());
        assert_eq!(client.subscriber_count(&key), 1);

        client.set_data(&key, 3_u32).expect("seed");
        assert_eq!(client.get::<u32>(&key).and_then(|e| e.value), Some(3));
    }

    #[tokio::test]
    async fn test_dropped_slot_never_starts_a_fetch() {
        let client = QueryClient::new();
        let key = query_key!["prototype", "p1"];
        let (loader, calls) = counted(7);
        client.fetch(&key, loader.clone(), FetchOptions::new()).await.expect("fetch");

        // A slot handed out before the drop must not load next to its replacement.
        let stale_slot = client.slot::<i32>(&key).expect("typed").expect("present");
        let report = client.invalidate(&key);
        assert_eq!(report.dropped, vec![key.clone()]);
        assert!(matches!(stale_slot.start(Some(loader.clone()), None, None), Ok(None)));
        assert!(!stale_slot.set_data(1));

        assert_eq!(client.fetch(&key, loader, FetchOptions::new()).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(
            &stale_slot,
            &client.slot::<i32>(&key).expect("typed").expect("present")
        ));
    }

    #[tokio::test]
    async fn test_drop_is_skipped_when_a_fetch_started() {
        let client = QueryClient::new();
        let key = query_key!["apis", "m1", 1];
        client.set_data(&key, 1_i32).expect("seed");

        let erased = client.inner.entries.get(&key).map(|e| Arc::clone(e.value())).expect("slot");
        assert!(matches!(erased.invalidate(), Invalidation::Drop));

        // A fetch lands between the drop decision and the removal.
        let slot = client.slot::<i32>(&key).expect("typed").expect("present");
        let (loader, _) = counted(2);
        assert!(matches!(slot.start(Some(loader), None, None), Ok(Some(Started::InFlight(_)))));
        assert!(!erased.retire_if_unused());
        assert!(client.inner.entries.remove_if(&key, |_, s| s.retire_if_unused()).is_none());
        assert_eq!(client.len(), 1);
    }

    #[test]
    fn test_subscription_ids_are_per_client() {
        let first = QueryClient::new();
        let second = QueryClient::new();
        let key = query_key!["model", "m1"];

        let a = first.attach::<i32>(&key).expect("attach").0;
        let b = first.attach::<i32>(&key).expect("attach").0;
        let c = second.attach::<i32>(&key).expect("attach").0;
        assert_eq!((a.id(), b.id(), c.id()), (1, 2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_removes_old_unobserved_entries() {
        let config = QueryConfig::new(
            Duration::ZERO,
            Duration::from_secs(10),
            RetryPolicy::none(),
        );
        let client = QueryClient::with_config(config);
        let observed = query_key!["observed"];
        client.set_data(&query_key!["old"], 1_i32).expect("seed");
        client.set_data(&observed, 2_i32).expect("seed");
        let _guard = client.subscribe::<i32, _>(&observed, |_| {}).expect("subscribe");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(client.gc(), 1);
        assert!(client.get::<i32>(&query_key!["old"]).is_none());
        assert!(client.get::<i32>(&observed).is_some());
    }
}
