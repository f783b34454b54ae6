//! Keyed query cache, read observers and mutations.
//!
//! This module provides a fetch cache keyed by [`QueryKey`](crate::key::QueryKey),
//! similar to SWR or TanStack Query.
//!
//! # Features
//!
//! - **Cache**: [`QueryClient`] owns every entry; concurrent fetches of one key share
//!   a single in-flight load, and failed loads are retried per [`RetryPolicy`]
//! - **Observers**: [`QueryObserver`] and [`Query`] gate on [`Readiness`], fetch on
//!   mount, and follow the entry as it changes
//! - **Mutations**: [`Mutation`] runs a write and invalidates the key prefixes it
//!   declares as affected
//!
//! # Example
//!
//! ```rust,no_run
//! use studio_cache::query::{FetchOptions, QueryClient, QueryDescriptor, loader};
//! use studio_cache::query_key;
//!
//! # async fn run() {
//! let client = QueryClient::new();
//!
//! let descriptor = QueryDescriptor::new(
//!     query_key!["model", "m1"],
//!     loader(|| async { Ok::<_, studio_cache::query::QueryError>("model m1".to_string()) }),
//! );
//! let mut observer = client.observe(descriptor);
//! assert!(observer.result().is_loading());
//!
//! let next = observer.changed().await;
//! assert!(next.is_some_and(|r| r.is_success()));
//!
//! client.invalidate(&query_key!["model"]);
//! # }
//! ```

mod cache;
mod client;
mod config;
mod error;
pub mod mutation;
pub mod observer;
mod retry;
mod state;

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

pub use cache::{CacheEntry, FetchStatus};
pub use client::{InvalidationReport, QueryClient, SubscriptionGuard};
pub use config::QueryConfig;
pub use error::QueryError;
pub use mutation::{Mutation, MutationState};
pub use observer::{Query, QueryDescriptor, QueryObserver};
pub use retry::{Backoff, RetryPolicy};
pub use state::{QueryResult, QueryStatus};

/// Values that can live in the cache.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// The function that performs the external fetch for a key.
pub type Loader<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync>;

/// Wraps an async closure as a [`Loader`].
pub fn loader<V, F, Fut>(f: F) -> Loader<V>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Whether a query may fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Readiness {
    #[default]
    Ready,
    /// A required parameter is missing; the string names it.
    NotReady(String),
    /// Explicitly turned off by the caller.
    Disabled,
}

impl Readiness {
    /// `Ready` if `value` is present, otherwise `NotReady(name)`.
    pub fn require<T>(name: &str, value: Option<&T>) -> Self {
        if value.is_some() {
            Self::Ready
        } else {
            Self::NotReady(name.to_string())
        }
    }

    /// Combines two requirements; the first non-ready one wins.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::Ready => other,
            gated => gated,
        }
    }

    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Per-call fetch options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub readiness: Readiness,
    /// Overrides [`QueryConfig::retry`] when the entry is first created.
    pub retry: Option<RetryPolicy>,
}

impl FetchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    #[must_use]
    pub fn enabled(self, enabled: bool) -> Self {
        self.readiness(if enabled {
            Readiness::Ready
        } else {
            Readiness::Disabled
        })
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}
