//! Message transport between a session and the document server.
//!
//! A [`Connector`] opens one [`Connection`] per attempt: a pair of channels
//! carrying text frames. The session never touches sockets directly, so
//! tests can drive it through [`Connection::in_memory`].
//!
//! ```text
//! DocumentSession ──outgoing──▶ writer task ──▶ WebSocket sink
//!        ▲                                            │
//!        └─────incoming──── reader task ◀── WebSocket stream
//! ```
//!
//! Reconnect delays come from [`Backoff`]: capped exponential growth with
//! random jitter so that clients dropped together do not return together.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ProtocolError;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// One live connection: frames to send and frames received.
///
/// `incoming` yields `None` once the remote side is gone.
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// The far end of an in-memory [`Connection`].
pub struct ConnectionPeer {
    /// Frames delivered to the client. Drop to close the connection.
    pub to_client: mpsc::UnboundedSender<String>,
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl Connection {
    /// A connection backed by channels only.
    pub fn in_memory() -> (Connection, ConnectionPeer) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        (
            Connection {
                outgoing: to_server,
                incoming: from_server,
            },
            ConnectionPeer {
                to_client,
                from_client,
            },
        )
    }
}

/// Opens connections to a document endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, uri: &str) -> BoxFuture<'static, Result<Connection, ProtocolError>>;
}

/// [`Connector`] over WebSocket text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, uri: &str) -> BoxFuture<'static, Result<Connection, ProtocolError>> {
        let uri = uri.to_owned();
        Box::pin(async move {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(uri.as_str())
                .await
                .map_err(|e| ProtocolError::Connect(e.to_string()))?;
            info!("Connected to {uri}");

            let (mut ws_sink, mut ws_source) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            // Writer: session → WebSocket. Ends when the session drops its sender.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sink.close().await;
            });

            // Reader: WebSocket → session. Dropping `in_tx` signals disconnect.
            tokio::spawn(async move {
                while let Some(frame) = ws_source.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            if in_tx.send(text.to_string()).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("WebSocket read error: {e}");
                            break;
                        }
                    }
                }
            });

            Ok(Connection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// `jitter` is the fraction of each delay that may be shaved off at
    /// random, clamped to `[0, 1]`.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        let capped = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter == 0.0 {
            return capped;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter);
        capped.mul_f64(1.0 - cut)
    }

    /// Delay the next attempt would use before jitter.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
