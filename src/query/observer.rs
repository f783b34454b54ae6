//! Read observers: the "hook" side of the cache.
//!
//! A [`QueryObserver`] is what a view holds for one resource. It is built from a
//! [`QueryDescriptor`] (key, loader, readiness) and follows the cache entry for
//! that key:
//!
//! 1. While the descriptor is gated, the observer reports `NotReady` or `Disabled`
//!    and never calls the loader
//! 2. When it becomes ready, it subscribes to the entry and, unless fresh data is
//!    cached, starts one fetch and reports `Loading` right away
//! 3. When the entry is invalidated, the cache refetches it because this observer
//!    counts as an active subscriber
//!
//! Views call [`QueryObserver::update`] with a freshly built descriptor on every
//! tick; the observer only re-subscribes when the key or readiness changed.
//!
//! [`Query`] wraps the same behavior as a [`SubscriptionSource`] stream.

use std::hash::{DefaultHasher, Hash, Hasher};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::key::QueryKey;
use crate::subscription::{SubscriptionId, SubscriptionSource};

use super::client::{Started, SubscriptionGuard};
use super::state::QueryResult;
use super::{CacheValue, FetchOptions, Loader, QueryClient, QueryError, Readiness, RetryPolicy};

/// Everything needed to read one resource: key, loader and options.
pub struct QueryDescriptor<V> {
    pub key: QueryKey,
    pub loader: Loader<V>,
    pub options: FetchOptions,
}

impl<V> Clone for QueryDescriptor<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            loader: self.loader.clone(),
            options: self.options.clone(),
        }
    }
}

impl<V> std::fmt::Debug for QueryDescriptor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<V> QueryDescriptor<V> {
    pub fn new(key: QueryKey, loader: Loader<V>) -> Self {
        Self {
            key,
            loader,
            options: FetchOptions::default(),
        }
    }

    #[must_use]
    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.options.readiness = readiness;
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.options = self.options.enabled(enabled);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = Some(retry);
        self
    }
}

enum Mount<V> {
    Gated(QueryResult<V>),
    Active {
        // Held for its Drop: keeps this observer counted as a subscriber.
        _guard: SubscriptionGuard,
        rx: watch::Receiver<QueryResult<V>>,
    },
    /// The key is cached with another value type.
    Failed(QueryResult<V>),
}

/// Follows one cache entry on behalf of a consumer.
pub struct QueryObserver<V: CacheValue> {
    client: QueryClient,
    descriptor: QueryDescriptor<V>,
    mount: Mount<V>,
}

impl<V: CacheValue> QueryObserver<V> {
    /// Creates the observer and, if the descriptor is ready, starts loading.
    pub fn new(client: QueryClient, descriptor: QueryDescriptor<V>) -> Self {
        let mount = Self::mount(&client, &descriptor);
        Self {
            client,
            descriptor,
            mount,
        }
    }

    fn mount(client: &QueryClient, descriptor: &QueryDescriptor<V>) -> Mount<V> {
        match &descriptor.options.readiness {
            Readiness::NotReady(_) => return Mount::Gated(QueryResult::not_ready()),
            Readiness::Disabled => return Mount::Gated(QueryResult::disabled()),
            Readiness::Ready => {}
        }

        let key = &descriptor.key;
        let (guard, mut rx) = match client.attach::<V>(key) {
            Ok(attached) => attached,
            Err(error) => return Mount::Failed(failed(error)),
        };

        match client.start_fetch(key, descriptor.loader.clone(), descriptor.options.clone()) {
            Ok(Started::Cached(_)) => debug!(%key, "observer mounted on fresh data"),
            // The fetch runs on its own task; the observer only watches the entry.
            Ok(Started::InFlight(_)) => debug!(%key, "observer mounted, fetch in flight"),
            Err(error) => warn!(%key, %error, "observer could not start fetch"),
        }
        // `result()` already reports the state reached here; `changed()` waits for
        // the next one.
        rx.borrow_and_update();

        Mount::Active { _guard: guard, rx }
    }

    /// Re-evaluates the observer against a freshly built descriptor.
    ///
    /// Re-subscribes (and fetches, if needed) only when the key or readiness
    /// changed. Returns `true` if it did.
    pub fn update(&mut self, descriptor: QueryDescriptor<V>) -> bool {
        let changed = descriptor.key != self.descriptor.key
            || descriptor.options.readiness != self.descriptor.options.readiness;
        self.descriptor = descriptor;
        if changed {
            // Mount first, then drop the old subscription, so a shared entry
            // never sees its subscriber count dip to zero in between.
            let mount = Self::mount(&self.client, &self.descriptor);
            self.mount = mount;
        }
        changed
    }

    pub const fn key(&self) -> &QueryKey {
        &self.descriptor.key
    }

    /// The current snapshot.
    pub fn result(&self) -> QueryResult<V> {
        match &self.mount {
            Mount::Gated(result) | Mount::Failed(result) => result.clone(),
            Mount::Active { rx, .. } => rx.borrow().clone(),
        }
    }

    /// Waits for the next change and returns the new snapshot.
    ///
    /// Never resolves while the observer is gated; call [`update`](Self::update)
    /// from another branch of a `select!` to move it on. Returns `None` if the
    /// entry went away.
    pub async fn changed(&mut self) -> Option<QueryResult<V>> {
        match &mut self.mount {
            Mount::Gated(_) | Mount::Failed(_) => std::future::pending().await,
            Mount::Active { rx, .. } => {
                rx.changed().await.ok()?;
                Some(rx.borrow_and_update().clone())
            }
        }
    }

    /// Refetches now, ignoring freshness. No-op while gated.
    pub async fn refetch(&self) -> Result<V, QueryError> {
        match &self.descriptor.options.readiness {
            Readiness::Ready => self.client.refetch(&self.descriptor.key).await,
            Readiness::NotReady(reason) => Err(QueryError::NotReady(reason.clone())),
            Readiness::Disabled => Err(QueryError::Disabled),
        }
    }
}

fn failed<V>(error: QueryError) -> QueryResult<V> {
    QueryResult {
        status: super::QueryStatus::Error,
        data: None,
        error: Some(error),
        is_stale: false,
    }
}

impl QueryClient {
    /// Creates a [`QueryObserver`] for `descriptor`.
    pub fn observe<V: CacheValue>(&self, descriptor: QueryDescriptor<V>) -> QueryObserver<V> {
        QueryObserver::new(self.clone(), descriptor)
    }
}

/// A query subscription that yields snapshots of one cache entry.
///
/// The stream starts with the current snapshot and then yields every change.
/// Its [`SubscriptionId`] covers the key and readiness, so a consumer diffing
/// subscriptions by id restarts the stream exactly when either changes.
///
/// # Example
///
/// ```rust,ignore
/// use studio_cache::subscription::Subscription;
/// use studio_cache::query::{Query, QueryClient};
///
/// let sub = Subscription::new(Query::new(client.clone(), descriptor))
///     .map(Message::ModelLoaded);
/// ```
pub struct Query<V> {
    client: QueryClient,
    descriptor: QueryDescriptor<V>,
}

impl<V: CacheValue> Query<V> {
    pub const fn new(client: QueryClient, descriptor: QueryDescriptor<V>) -> Self {
        Self { client, descriptor }
    }
}

impl<V: CacheValue> SubscriptionSource for Query<V> {
    type Output = QueryResult<V>;

    fn stream(&self) -> BoxStream<'static, Self::Output> {
        let observer = self.client.observe(self.descriptor.clone());
        let first = observer.result();

        stream::once(async move { first })
            .chain(stream::unfold(observer, |mut observer| async move {
                let next = observer.changed().await?;
                Some((next, observer))
            }))
            .boxed()
    }

    fn id(&self) -> SubscriptionId {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        SubscriptionId::of::<Self>(hasher.finish())
    }
}

impl<V> Hash for Query<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.descriptor.key.hash(state);
        self.descriptor.options.readiness.hash(state);
    }
}
