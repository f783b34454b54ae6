//! Controllable stand-ins for the network, for tests.
//!
//! [`MockConnector`] plays the remote end of every connection a
//! [`ConnectionPool`](crate::connection::ConnectionPool) opens: tests push frames
//! in with [`MockRemote::emit`] and read what the client sent with
//! [`MockRemote::next_sent`].
//!
//! [`MockResourceApi`] answers [`ResourceApi`] requests from canned responses and
//! records every request it saw.
//!
//! ```
//! use studio_cache::connection::ConnectionPool;
//! use studio_cache::mock::MockConnector;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let connector = MockConnector::new();
//! let pool = ConnectionPool::new(connector.clone());
//!
//! let conn = pool.get_connection("ws://studio.test/io", Some("t1")).await.unwrap();
//! conn.emit("join", &"room-1").unwrap();
//!
//! let remote = &connector.remotes()[0];
//! assert!(remote.next_sent().await.is_some());
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream;
use futures::{FutureExt as _, StreamExt as _};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::connection::{ConnectionError, Connector, Envelope, Link, LinkCommand, LinkEvent};
use crate::query::QueryError;
use crate::resources::{ApiRequest, ResourceApi};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The remote side of one mock connection.
#[derive(Clone)]
pub struct MockRemote {
    url: Url,
    incoming: mpsc::UnboundedSender<LinkEvent>,
    sent: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkCommand>>>,
}

impl MockRemote {
    /// The URL the client connected to, access token included.
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Sends `data` under `event` to the client.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> Result<(), ConnectionError> {
        let data = serde_json::to_value(data).map_err(|e| ConnectionError::Encode(e.to_string()))?;
        let text = serde_json::to_string(&Envelope {
            event: event.to_string(),
            data,
        })
        .map_err(|e| ConnectionError::Encode(e.to_string()))?;
        self.send_raw(LinkEvent::Text(text))
    }

    /// Delivers a raw link event, e.g. a malformed frame or a disconnect.
    pub fn send_raw(&self, event: LinkEvent) -> Result<(), ConnectionError> {
        self.incoming.send(event).map_err(|_| ConnectionError::Closed)
    }

    /// The next command the client sent. `None` once the client side is gone.
    pub async fn next_sent(&self) -> Option<LinkCommand> {
        self.sent.lock().await.recv().await
    }
}

#[derive(Default)]
struct ConnectorState {
    connects: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Duration>,
    remotes: Mutex<Vec<MockRemote>>,
}

/// A [`Connector`] whose connections end in [`MockRemote`]s.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes connection attempts fail until switched off again.
    pub fn fail_next(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    /// Delays every connection attempt.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.state.delay) = delay;
    }

    /// Number of connection attempts, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// The remotes of every successful connection, oldest first.
    pub fn remotes(&self) -> Vec<MockRemote> {
        lock(&self.state.remotes).clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Link, ConnectionError>> {
        let state = self.state.clone();
        let url = url.clone();
        async move {
            state.connects.fetch_add(1, Ordering::SeqCst);
            let delay = *lock(&state.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if state.fail.load(Ordering::SeqCst) {
                return Err(ConnectionError::ConnectFailed("connection refused".into()));
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            lock(&state.remotes).push(MockRemote {
                url,
                incoming: event_tx,
                sent: Arc::new(tokio::sync::Mutex::new(cmd_rx)),
            });

            let incoming = stream::unfold(event_rx, |mut rx| async move {
                let event = rx.recv().await?;
                Some((event, rx))
            })
            .boxed();
            Ok(Link {
                outgoing: cmd_tx,
                incoming,
            })
        }
        .boxed()
    }
}

type RouteKey = (Method, String);

#[derive(Default)]
struct ApiState {
    routes: Mutex<HashMap<RouteKey, Result<Value, QueryError>>>,
    calls: Mutex<Vec<ApiRequest>>,
    delay: Mutex<Duration>,
}

/// A [`ResourceApi`] that answers from canned responses.
///
/// Requests to unknown routes fail with HTTP 404.
#[derive(Clone, Default)]
pub struct MockResourceApi {
    state: Arc<ApiState>,
}

impl MockResourceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: Method, path: &str, body: Value) {
        lock(&self.state.routes).insert((method, path.to_string()), Ok(body));
    }

    pub fn respond_get(&self, path: &str, body: Value) {
        self.respond(Method::GET, path, body);
    }

    pub fn fail(&self, method: Method, path: &str, error: QueryError) {
        lock(&self.state.routes).insert((method, path.to_string()), Err(error));
    }

    /// Delays every response.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.state.delay) = delay;
    }

    /// Every request received so far, in order.
    pub fn calls(&self) -> Vec<ApiRequest> {
        lock(&self.state.calls).clone()
    }

    pub fn call_count(&self, method: &Method, path: &str) -> usize {
        lock(&self.state.calls)
            .iter()
            .filter(|call| call.method == *method && call.path == path)
            .count()
    }
}

impl ResourceApi for MockResourceApi {
    fn request(&self, request: ApiRequest) -> BoxFuture<'static, Result<Value, QueryError>> {
        let response = lock(&self.state.routes)
            .get(&(request.method.clone(), request.path.clone()))
            .cloned()
            .unwrap_or_else(|| {
                Err(QueryError::Http {
                    status: 404,
                    message: format!("no route for {} {}", request.method, request.path),
                })
            });
        let delay = *lock(&self.state.delay);
        lock(&self.state.calls).push(request);

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            response
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_mock_api_records_and_answers() {
        let api = MockResourceApi::new();
        api.respond_get("/user/self", json!({ "id": "u1" }));

        let ok = api.request(ApiRequest::get("/user/self")).await;
        assert_eq!(ok, Ok(json!({ "id": "u1" })));

        let missing = api.request(ApiRequest::get("/nope")).await;
        assert!(matches!(missing, Err(QueryError::Http { status: 404, .. })));

        assert_eq!(api.calls().len(), 2);
        assert_eq!(api.call_count(&Method::GET, "/user/self"), 1);
    }

    #[tokio::test]
    async fn test_mock_connector_links_both_ends() {
        let connector = MockConnector::new();
        let url = Url::parse("ws://studio.test/io").expect("url");
        let mut link = connector.connect(&url).await.expect("link");

        let remote = &connector.remotes()[0];
        remote.emit("ping", &1).expect("emit");
        assert_eq!(
            link.incoming.next().await,
            Some(LinkEvent::Text(r#"{"event":"ping","data":1}"#.to_string()))
        );

        link.outgoing.send(LinkCommand::Close).expect("send");
        assert_eq!(remote.next_sent().await, Some(LinkCommand::Close));
    }

    #[tokio::test]
    async fn test_mock_connector_failure() {
        let connector = MockConnector::new();
        connector.fail_next(true);
        let url = Url::parse("ws://studio.test/io").expect("url");
        assert!(connector.connect(&url).await.is_err());
        assert!(connector.remotes().is_empty());
        assert_eq!(connector.connect_count(), 1);
    }
}
