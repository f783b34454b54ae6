//! Authentication state.
//!
//! A [`SessionStore`] holds one [`Session`]: anonymous, or a user plus the
//! access token the resource layer sends as a bearer header and embeds in the
//! keys of access-controlled queries. Changes are published synchronously on a
//! `watch` channel, so the next key derived after `login` or `logout` already
//! sees the new token.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::resources::User;
use crate::storage::{Storage, StorageError};

const SESSION_KEY: &str = "session";

/// A bearer token and when it stops being valid.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
        }
    }

    #[must_use]
    pub const fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| now >= at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires", &self.expires)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: Option<AccessToken>,
    pub user: Option<User>,
}

impl Session {
    pub const fn state(&self) -> SessionState {
        if self.access_token.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.access_token.as_ref().map(|t| t.token.as_str())
    }
}

/// Shared handle to the current session.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Session>>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("state", &self.state())
            .finish()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Starts anonymous.
    pub fn new() -> Self {
        Self::with_session(Session::default())
    }

    pub fn with_session(session: Session) -> Self {
        let (tx, _) = watch::channel(session);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.tx.borrow().state()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().token().map(str::to_string)
    }

    pub fn user(&self) -> Option<User> {
        self.tx.borrow().user.clone()
    }

    /// Follows session changes.
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    pub fn login(&self, user: User, token: AccessToken) {
        info!(user = %user.id, "logged in");
        self.tx.send_replace(Session {
            access_token: Some(token),
            user: Some(user),
        });
    }

    /// Replaces the access token of an authenticated session.
    ///
    /// Does nothing and returns `false` while anonymous.
    pub fn refresh_access(&self, token: AccessToken) -> bool {
        self.tx.send_if_modified(|session| {
            if session.access_token.is_none() {
                return false;
            }
            session.access_token = Some(token);
            true
        })
    }

    /// Clears the session, then tells the server.
    ///
    /// Local state is cleared before `notify` runs and regardless of its outcome.
    /// A failed notification is logged and otherwise ignored.
    pub async fn logout<F, Fut, E>(&self, notify: F)
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let previous = self.tx.send_replace(Session::default());
        let Some(token) = previous.access_token else {
            debug!("logout while anonymous");
            return;
        };
        info!("logged out");

        if let Err(error) = notify(token.token).await {
            warn!(%error, "remote logout failed; local session already cleared");
        }
    }

    /// Saves the session so a later process can pick it up.
    pub fn persist_to(&self, storage: &Storage) -> Result<(), StorageError> {
        let session = self.snapshot();
        if session.access_token.is_some() {
            storage.set(SESSION_KEY, &session)
        } else {
            storage.remove(SESSION_KEY)
        }
    }

    /// Loads a saved session. Returns `true` if one was restored.
    ///
    /// An expired token is discarded along with its user.
    pub fn restore_from(&self, storage: &Storage) -> Result<bool, StorageError> {
        let Some(session) = storage.get::<Session>(SESSION_KEY)? else {
            return Ok(false);
        };
        if session
            .access_token
            .as_ref()
            .is_none_or(|token| token.is_expired_at(Utc::now()))
        {
            debug!("discarding saved session");
            storage.remove(SESSION_KEY)?;
            return Ok(false);
        }
        self.tx.send_replace(session);
        Ok(true)
    }
}
