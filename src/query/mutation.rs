//! Mutations: writes that invalidate the queries they affect.
//!
//! A [`Mutation`] wraps an async write (POST, PUT, PATCH, DELETE) together with
//! the key prefixes it makes stale. Unlike queries, mutations keep no cache of
//! their own; they only report their last state.
//!
//! On success every affected prefix is invalidated before
//! [`execute`](Mutation::execute) returns, so observed entries are already
//! refetching when the caller continues. On failure the error goes back to the
//! caller and the cache is left alone.
//!
//! # Example
//!
//! ```rust,ignore
//! use studio_cache::query::Mutation;
//! use studio_cache::query_key;
//!
//! let create_child = Mutation::new(
//!     client.clone(),
//!     |parent_id: String| Box::pin(async move { api.create_child(&parent_id).await }),
//!     |parent_id, _child| vec![query_key!["children", parent_id.as_str()]],
//! );
//!
//! let child = create_child.execute("p1".to_string()).await?;
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::debug;

use crate::key::QueryKey;

use super::{QueryClient, QueryError};

/// The state of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState<T> {
    /// Mutation is idle (not yet started).
    Idle,
    /// Mutation is in progress.
    Loading,
    /// Mutation succeeded with a result.
    Success(T),
    /// Mutation failed with an error.
    Error(String),
}

impl<T> MutationState<T> {
    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    /// Returns `true` if the mutation is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

type Mutator<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync>;
type Affected<I, O> = Arc<dyn Fn(&I, &O) -> Vec<QueryKey> + Send + Sync>;

/// A write operation plus the cache prefixes it invalidates.
pub struct Mutation<I, O> {
    client: QueryClient,
    mutator: Mutator<I, O>,
    affected: Affected<I, O>,
    state: watch::Sender<MutationState<O>>,
}

impl<I, O> fmt::Debug for Mutation<I, O>
where
    O: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<I, O> Mutation<I, O>
where
    I: Clone + Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Creates a mutation.
    ///
    /// # Arguments
    ///
    /// * `client` - The query client whose entries get invalidated
    /// * `mutator` - An async function that performs the write
    /// * `affected` - The key prefixes made stale by a successful write, computed
    ///   from its input and output
    pub fn new<F, A>(client: QueryClient, mutator: F, affected: A) -> Self
    where
        F: Fn(I) -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync + 'static,
        A: Fn(&I, &O) -> Vec<QueryKey> + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(MutationState::Idle);
        Self {
            client,
            mutator: Arc::new(mutator),
            affected: Arc::new(affected),
            state,
        }
    }

    /// Runs the write and, on success, invalidates the affected prefixes.
    pub async fn execute(&self, input: I) -> Result<O, QueryError> {
        self.state.send_replace(MutationState::Loading);

        match (self.mutator)(input.clone()).await {
            Ok(output) => {
                for prefix in (self.affected)(&input, &output) {
                    let report = self.client.invalidate(&prefix);
                    debug!(%prefix, refetched = report.refetched.len(), "mutation invalidated");
                }
                self.state.send_replace(MutationState::Success(output.clone()));
                Ok(output)
            }
            Err(error) => {
                self.state.send_replace(MutationState::Error(error.to_string()));
                Err(error)
            }
        }
    }

    /// The state of the most recent execution.
    pub fn state(&self) -> MutationState<O> {
        self.state.borrow().clone()
    }

    /// Follows state changes.
    pub fn watch(&self) -> watch::Receiver<MutationState<O>> {
        self.state.subscribe()
    }

    /// Returns the mutation to `Idle`.
    pub fn reset(&self) {
        self.state.send_replace(MutationState::Idle);
    }
}
