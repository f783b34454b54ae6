//! Persistent bidirectional connections, one per endpoint URL.
//!
//! The [`ConnectionPool`] hands out [`ConnectionHandle`]s. The first request for a
//! URL establishes the connection; every later request for the same URL gets the
//! same handle back, whatever access token it presents. Handles live until
//! [`ConnectionPool::shutdown`].
//!
//! Frames on the wire are JSON text messages shaped like
//! `{"event": "<name>", "data": <payload>}`. Consumers register listeners per
//! event name with [`ConnectionHandle::on`], or take them as a stream with
//! [`ConnectionHandle::events`].
//!
//! The transport is behind the [`Connector`] trait. [`WebSocketConnector`] is the
//! real one, built on `tokio-tungstenite`; [`crate::mock::MockConnector`] serves
//! tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use studio_cache::connection::{ConnectionPool, WebSocketConnector};
//!
//! # async fn run() {
//! let pool = ConnectionPool::new(WebSocketConnector::new());
//!
//! if let Some(conn) = pool.get_connection("wss://studio.example.com/socket", Some("token")).await {
//!     conn.on("prototype:updated", |data| println!("updated: {data}"));
//!     let _ = conn.emit("join", &serde_json::json!({ "room": "p1" }));
//! }
//! # }
//! ```

mod handle;
mod pool;
mod websocket;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub use handle::{ConnectionHandle, ConnectionState, EventStream, ListenerId};
pub use pool::ConnectionPool;
pub use websocket::WebSocketConnector;

/// Errors raised while establishing or using a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid endpoint URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// Commands sent to a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Send a text frame.
    Send(String),
    /// Close the link.
    Close,
}

/// What a live link reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame from the remote.
    Text(String),
    /// Normal closure.
    Disconnected,
    /// Communication error; the link is gone.
    Error(String),
}

/// An established transport: a command sender and a stream of incoming events.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<LinkCommand>,
    pub incoming: BoxStream<'static, LinkEvent>,
}

/// Establishes links to remote endpoints.
pub trait Connector: Send + Sync + 'static {
    /// Connects to `url`, which already carries the access token.
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Link, ConnectionError>>;
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Appends the access token to `url` as the `access_token` query parameter.
pub fn authenticated_url(url: &str, token: Option<&str>) -> Result<Url, ConnectionError> {
    let mut parsed = Url::parse(url).map_err(|e| ConnectionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if let Some(token) = token {
        parsed.query_pairs_mut().append_pair("access_token", token);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticated_url_appends_token() {
        let url = authenticated_url("wss://studio.example.com/socket", Some("a b&c"))
            .expect("valid url");
        assert_eq!(
            url.as_str(),
            "wss://studio.example.com/socket?access_token=a+b%26c"
        );
    }

    #[test]
    fn test_authenticated_url_keeps_existing_query() {
        let url = authenticated_url("ws://localhost:9000/io?v=4", Some("t1")).expect("valid url");
        assert_eq!(url.as_str(), "ws://localhost:9000/io?v=4&access_token=t1");

        let anonymous = authenticated_url("ws://localhost:9000/io", None).expect("valid url");
        assert_eq!(anonymous.query(), None);
    }

    #[test]
    fn test_invalid_url_is_reported() {
        let err = authenticated_url("not a url", Some("t")).expect_err("invalid url");
        assert!(matches!(err, ConnectionError::InvalidUrl { .. }));
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: Envelope = serde_json::from_str(r#"{"event":"ping"}"#).expect("parse");
        assert_eq!(envelope.event, "ping");
        assert!(envelope.data.is_null());
    }
}
