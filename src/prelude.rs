//! Prelude module for convenient imports.
//!
//! ```
//! use studio_cache::prelude::*;
//! ```

pub use crate::config::StudioConfig;
pub use crate::connection::{ConnectionHandle, ConnectionPool, WebSocketConnector};
pub use crate::key::{KeyPart, QueryKey};
pub use crate::query::{
    FetchOptions, Mutation, MutationState, Query, QueryClient, QueryConfig, QueryDescriptor,
    QueryError, QueryObserver, QueryResult, QueryStatus, Readiness, RetryPolicy,
};
pub use crate::query_key;
pub use crate::refs::RefStore;
pub use crate::resources::{ResourceApi, Resources};
pub use crate::session::{AccessToken, SessionStore};
pub use crate::storage::Storage;
pub use crate::subscription::{Subscription, SubscriptionSource};
