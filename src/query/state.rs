use super::QueryError;
use super::cache::{CacheEntry, FetchStatus};

/// The status a consumer sees for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// A required parameter is missing; nothing has been fetched.
    NotReady,
    /// The query was disabled by the caller.
    Disabled,
    /// The entry exists but no fetch has started yet.
    Idle,
    /// A fetch is in flight.
    Loading,
    Success,
    Error,
}

/// A snapshot of a query's state.
///
/// `data` and `error` can both be set: after a failed refetch the last good value
/// is still reported.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    pub error: Option<QueryError>,
    /// Whether the data is stale and should be refetched.
    pub is_stale: bool,
}

impl<T> QueryResult<T> {
    pub const fn not_ready() -> Self {
        Self::gated(QueryStatus::NotReady)
    }

    pub const fn disabled() -> Self {
        Self::gated(QueryStatus::Disabled)
    }

    pub const fn loading() -> Self {
        Self::gated(QueryStatus::Loading)
    }

    const fn gated(status: QueryStatus) -> Self {
        Self {
            status,
            data: None,
            error: None,
            is_stale: false,
        }
    }

    /// Returns the data if the query has any, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if the query is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Loading)
    }

    /// Returns `true` if the query succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    /// Returns `true` if the query failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Returns `true` while the query is gated and will not fetch.
    pub const fn is_gated(&self) -> bool {
        matches!(self.status, QueryStatus::NotReady | QueryStatus::Disabled)
    }
}

impl<T: Clone> From<&CacheEntry<T>> for QueryResult<T> {
    fn from(entry: &CacheEntry<T>) -> Self {
        let status = match entry.status {
            FetchStatus::Idle => QueryStatus::Idle,
            FetchStatus::Pending => QueryStatus::Loading,
            FetchStatus::Success => QueryStatus::Success,
            FetchStatus::Error => QueryStatus::Error,
        };
        Self {
            status,
            data: entry.value.clone(),
            error: entry.error.clone(),
            is_stale: entry.is_stale,
        }
    }
}
