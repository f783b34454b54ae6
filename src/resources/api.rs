//! The HTTP side of the resource layer.

use futures::FutureExt as _;
use futures::future::BoxFuture;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;

use crate::query::QueryError;

/// One request against the studio API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, with its query string.
    pub path: String,
    pub body: Option<Value>,
    /// Bearer token, if the caller is authenticated.
    pub token: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            token: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// Performs studio API requests.
///
/// Implementations return the decoded JSON body (`Value::Null` for an empty
/// one) and map failures onto [`QueryError`] so that retry can tell transient
/// failures from permanent ones.
pub trait ResourceApi: Send + Sync + 'static {
    fn request(&self, request: ApiRequest) -> BoxFuture<'static, Result<Value, QueryError>>;

    /// Tells the server the session ended.
    fn logout(&self, token: String) -> BoxFuture<'static, Result<(), QueryError>> {
        self.request(ApiRequest::new(Method::POST, "/auth/logout").token(Some(token)))
            .map(|result| result.map(|_| ()))
            .boxed()
    }
}

/// [`ResourceApi`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpResourceApi {
    client: Client,
    base_url: String,
}

impl HttpResourceApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

impl ResourceApi for HttpResourceApi {
    fn request(&self, request: ApiRequest) -> BoxFuture<'static, Result<Value, QueryError>> {
        let url = self.url(&request.path);
        let mut rb = self.client.request(request.method.clone(), &url);
        if let Some(token) = &request.token {
            rb = rb.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            rb = rb.json(body);
        }

        async move {
            debug!(method = %request.method, path = %request.path, "api request");
            let resp = rb
                .send()
                .await
                .map_err(|e| QueryError::NetworkError(e.to_string()))?;

            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| QueryError::NetworkError(format!("failed to read body: {e}")))?;

            if !status.is_success() {
                return Err(QueryError::Http {
                    status: status.as_u16(),
                    message: error_message(&text),
                });
            }

            if text.trim().is_empty() {
                Ok(Value::Null)
            } else {
                serde_json::from_str(&text).map_err(|e| QueryError::Decode(e.to_string()))
            }
        }
        .boxed()
    }
}

/// The API reports errors as `{"message": "..."}`; fall back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}
