//! WebSocket transport for [`ConnectionPool`](super::ConnectionPool).
//!
//! For `wss://` endpoints enable one of the TLS features:
//!
//! - `native-tls` - Uses the platform's native TLS implementation
//! - `rustls` - Uses rustls with native root certificates

use futures::future::BoxFuture;
use futures::stream::SplitSink;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _, stream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use super::{ConnectionError, Connector, Link, LinkCommand, LinkEvent};

type Writer = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connects over WebSocket with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Pumps frames between the socket and the link channels until either side closes.
    async fn run_link_loop(
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
    ) {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if event_tx.send(LinkEvent::Text(text.to_string())).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = event_tx.send(LinkEvent::Disconnected);
                            break;
                        }
                        // Binary, ping and pong frames carry no events.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = event_tx.send(LinkEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Send(text)) => {
                            if let Err(e) = Self::send_text(&mut write, text).await {
                                let _ = event_tx.send(LinkEvent::Error(e));
                                break;
                            }
                        }
                        Some(LinkCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            let _ = event_tx.send(LinkEvent::Disconnected);
                            break;
                        }
                    }
                }
            }
        }

        let _ = write.close().await;
    }

    async fn send_text(write: &mut Writer, text: String) -> Result<(), String> {
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| e.to_string())
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Link, ConnectionError>> {
        let url = url.clone();
        async move {
            let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
                warn!(host = url.host_str().unwrap_or_default(), error = %e, "websocket connect failed");
                ConnectionError::ConnectFailed(e.to_string())
            })?;
            debug!(host = url.host_str().unwrap_or_default(), "websocket connected");

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::run_link_loop(ws_stream, event_tx, cmd_rx));

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
