use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{ConnectionError, ConnectionHandle, Connector, authenticated_url};

type Cell = Arc<OnceCell<Arc<ConnectionHandle>>>;

/// Process-wide registry of connections, keyed by endpoint URL.
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    connections: DashMap<String, Cell>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.inner.connections.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new<C: Connector>(connector: C) -> Self {
        Self::with_connector(Arc::new(connector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                connections: DashMap::new(),
            }),
        }
    }

    /// Returns the connection for `url`, establishing it on first use.
    ///
    /// The first successful caller decides the access token. Later callers get
    /// the same handle even if they present another token; the mismatch is
    /// logged, not acted on. Concurrent first calls share one attempt.
    ///
    /// Returns `None` if the connection could not be established. Nothing is
    /// cached in that case, so a later call tries again.
    pub async fn get_connection(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Option<Arc<ConnectionHandle>> {
        let cell = self
            .inner
            .connections
            .entry(url.to_string())
            .or_default()
            .clone();

        let result = cell
            .get_or_try_init(|| self.establish(url, token))
            .await;

        match result {
            Ok(handle) => {
                if handle.token() != token {
                    warn!(url, "reusing connection established with a different access token");
                }
                Some(handle.clone())
            }
            Err(error) => {
                warn!(url, %error, "could not establish connection");
                None
            }
        }
    }

    async fn establish(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let endpoint = authenticated_url(url, token)?;
        debug!(url, "establishing connection");
        let link = self.inner.connector.connect(&endpoint).await?;
        info!(url, "connection established");
        Ok(ConnectionHandle::start(
            url.to_string(),
            token.map(str::to_string),
            link,
        ))
    }

    /// The established connection for `url`, without connecting.
    pub fn get(&self, url: &str) -> Option<Arc<ConnectionHandle>> {
        self.inner
            .connections
            .get(url)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of established connections.
    pub fn len(&self) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every connection and forgets them.
    pub fn shutdown(&self) {
        let cells: Vec<Cell> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.connections.clear();

        for cell in cells {
            if let Some(handle) = cell.get() {
                debug!(url = handle.url(), "closing connection");
                handle.close();
            }
        }
    }
}
