//! # studio-cache
//!
//! Client-side data access and cache coordination for a vehicle-prototyping
//! studio: models, their vehicle API catalogues, prototypes and feedback.
//!
//! ## Core Components
//!
//! - [`QueryClient`](query::QueryClient): keyed fetch cache with in-flight
//!   de-duplication, retry, prefix invalidation and change notification
//! - [`QueryObserver`](query::QueryObserver) and [`Mutation`](query::Mutation):
//!   the read and write sides consumers hold on to
//! - [`Resources`](resources::Resources): the studio's concrete queries and
//!   mutations over a [`ResourceApi`](resources::ResourceApi)
//! - [`ConnectionPool`](connection::ConnectionPool): one shared bidirectional
//!   connection per endpoint URL
//! - [`SessionStore`](session::SessionStore): authentication state whose token
//!   feeds into cache keys
//! - [`RefStore`](refs::RefStore): named ephemeral UI references
//! - [`Storage`](storage::Storage): durable key-value storage with expiry
//!
//! Every service is an explicit, cheaply cloneable handle; nothing is global.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use studio_cache::prelude::*;
//!
//! # async fn run() {
//! let config = StudioConfig::from_env().unwrap_or_default();
//! let client = QueryClient::with_config(config.query.clone());
//! let session = SessionStore::new();
//! let resources = Resources::new(client.clone(), session, Arc::new(config.resource_api()));
//!
//! let mut model = client.observe(resources.model(Some("m1")));
//! while let Some(result) = model.changed().await {
//!     if let Some(model) = result.data() {
//!         println!("{}", model.name);
//!         break;
//!     }
//! }
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod key;
pub mod logging;
pub mod mock;
pub mod prelude;
pub mod query;
pub mod refs;
pub mod resources;
pub mod session;
pub mod storage;
pub mod subscription;
