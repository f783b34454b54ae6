use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ConnectionError, Envelope, Link, LinkCommand, LinkEvent};
use crate::subscription::{SubscriptionId, SubscriptionSource};

/// Identifies one registered listener, for [`ConnectionHandle::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Lifecycle of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Closed normally, by either side.
    Disconnected,
    /// Dropped after a communication error.
    Failed(String),
}

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// A live connection shared by every consumer of one endpoint URL.
pub struct ConnectionHandle {
    url: String,
    token: Option<String>,
    outgoing: mpsc::UnboundedSender<LinkCommand>,
    listeners: DashMap<String, Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("url", &self.url)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Wraps an established link and starts dispatching its frames.
    pub(crate) fn start(url: String, token: Option<String>, link: Link) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connected);
        let handle = Arc::new(Self {
            url,
            token,
            outgoing: link.outgoing,
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(0),
            state,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::dispatch_loop(
            Arc::downgrade(&handle),
            handle.shutdown.clone(),
            link.incoming,
        ));
        handle
    }

    async fn dispatch_loop(
        handle: Weak<Self>,
        shutdown: CancellationToken,
        mut incoming: BoxStream<'static, LinkEvent>,
    ) {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = incoming.next() => event,
            };
            let Some(handle) = handle.upgrade() else {
                break;
            };
            match event {
                Some(LinkEvent::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => handle.dispatch(&envelope),
                    Err(error) => warn!(url = %handle.url, %error, "dropping malformed frame"),
                },
                Some(LinkEvent::Error(error)) => {
                    warn!(url = %handle.url, %error, "connection failed");
                    handle.state.send_replace(ConnectionState::Failed(error));
                    break;
                }
                Some(LinkEvent::Disconnected) | None => {
                    debug!(url = %handle.url, "connection closed");
                    handle.state.send_replace(ConnectionState::Disconnected);
                    break;
                }
            }
        }
    }

    fn dispatch(&self, envelope: &Envelope) {
        // Clone the listeners out so a callback may call `on`/`off` itself.
        let listeners: Vec<Listener> = self
            .listeners
            .get(&envelope.event)
            .map(|entry| entry.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();
        trace!(event = %envelope.event, listeners = listeners.len(), "dispatching");
        for listener in listeners {
            listener(&envelope.data);
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The access token the connection was established with.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    /// Follows state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Registers `listener` for `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let Some(mut entry) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(listener_id, _)| *listener_id != id);
        let removed = entry.len() != before;
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.listeners.remove_if(event, |_, listeners| listeners.is_empty());
        }
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |entry| entry.len())
    }

    /// Sends `data` under `event`.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> Result<(), ConnectionError> {
        let data = serde_json::to_value(data).map_err(|e| ConnectionError::Encode(e.to_string()))?;
        let frame = serde_json::to_string(&Envelope {
            event: event.to_string(),
            data,
        })
        .map_err(|e| ConnectionError::Encode(e.to_string()))?;
        self.outgoing
            .send(LinkCommand::Send(frame))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Payloads of `event` as a [`SubscriptionSource`].
    pub fn events(self: &Arc<Self>, event: &str) -> EventStream {
        EventStream {
            handle: self.clone(),
            event: event.to_string(),
        }
    }

    /// Closes the link and stops dispatching.
    pub fn close(&self) {
        let _ = self.outgoing.send(LinkCommand::Close);
        self.shutdown.cancel();
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

/// The payloads of one event on one connection.
///
/// Each stream registers its own listener and removes it when dropped.
pub struct EventStream {
    handle: Arc<ConnectionHandle>,
    event: String,
}

struct ListenerGuard {
    handle: Arc<ConnectionHandle>,
    event: String,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.handle.off(&self.event, self.id);
    }
}

impl SubscriptionSource for EventStream {
    type Output = Value;

    fn stream(&self) -> BoxStream<'static, Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.handle.on(&self.event, move |data| {
            let _ = tx.send(data.clone());
        });
        let guard = ListenerGuard {
            handle: self.handle.clone(),
            event: self.event.clone(),
            id,
        };

        stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let value = rx.recv().await?;
            Some((value, (rx, guard)))
        })
        .boxed()
    }

    fn id(&self) -> SubscriptionId {
        let mut hasher = DefaultHasher::new();
        self.handle.url.hash(&mut hasher);
        self.event.hash(&mut hasher);
        SubscriptionId::of::<Self>(hasher.finish())
    }
}
