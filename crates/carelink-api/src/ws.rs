//! WebSocket connection to the notification channel.
//!
//! This module handles a *single* connection: derive the channel URL,
//! open it with a bounded handshake, then pump frames until the peer
//! closes or the stream errors. Reconnection policy, polling fallback,
//! and event fan-out belong to `carelink-core`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::wire::{ClientMessage, ServerEvent};

/// Fixed path of the notification channel on the portal backend.
const EVENTS_PATH: &str = "/ws/notifications";

// ── Channel URL derivation ───────────────────────────────────────────

/// Derive the WebSocket URL from the configured HTTP base URL.
///
/// Rewrites the scheme to its WebSocket equivalent (`https` → `wss`),
/// appends the fixed events path, and carries the bearer token as a
/// query parameter -- browsers cannot set headers on WS upgrades, and
/// the backend keeps one auth path for all clients.
pub fn events_url(base: &Url, token: &SecretString) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::WebSocket(format!("unsupported scheme: {other}"))),
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::WebSocket("base URL cannot carry a ws scheme".into()))?;
    url.set_path(EVENTS_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair("token", token.expose_secret());

    Ok(url)
}

// ── Single connection lifecycle ──────────────────────────────────────

/// An open WebSocket connection to the notification channel.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WsConnection {
    /// Open a connection with a bounded handshake.
    ///
    /// The timeout covers TCP connect, TLS, and the upgrade -- the
    /// transport alone would only surface stalls via its own close
    /// callbacks, which can take arbitrarily long.
    pub async fn connect(url: &Url, connect_timeout: Duration) -> Result<Self, Error> {
        tracing::info!(url = %redacted(url), "Connecting to notification channel");

        let uri: tungstenite::http::Uri = url.as_str().parse().map_err(
            |e: tungstenite::http::uri::InvalidUri| Error::WebSocket(e.to_string()),
        )?;
        let request = ClientRequestBuilder::new(uri);

        let (stream, _response) =
            tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| Error::Timeout {
                    timeout_secs: connect_timeout.as_secs(),
                })?
                .map_err(|e| Error::WebSocket(e.to_string()))?;

        tracing::info!("Notification channel connected");
        Ok(Self { stream })
    }

    /// Pump the connection until it ends.
    ///
    /// Inbound text frames are parsed and handed to `on_event` in arrival
    /// order; malformed frames are logged and dropped. Messages arriving
    /// on `outbound` are serialized and written to the peer.
    ///
    /// Returns `Ok(())` on a clean close (close frame, stream end, or
    /// cancellation) and `Err` on a transport failure.
    pub async fn run<F>(
        self,
        outbound: &mut mpsc::Receiver<ClientMessage>,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ServerEvent),
    {
        let (mut write, mut read) = self.stream.split();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                message = outbound.recv() => {
                    let Some(message) = message else { return Ok(()) };
                    let text = serde_json::to_string(&message)
                        .map_err(|e| Error::WebSocket(e.to_string()))?;
                    write
                        .send(tungstenite::Message::text(text))
                        .await
                        .map_err(|e| Error::WebSocket(e.to_string()))?;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            match ServerEvent::parse(&text) {
                                Some(event) => on_event(event),
                                None => {
                                    tracing::warn!(
                                        frame = %text,
                                        "Dropping malformed channel frame"
                                    );
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Ping(_))) => {
                            // tungstenite replies with pong automatically
                            tracing::trace!("Channel ping");
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            if let Some(ref cf) = frame {
                                tracing::info!(
                                    code = %cf.code,
                                    reason = %cf.reason,
                                    "Channel close frame received"
                                );
                            } else {
                                tracing::info!("Channel close frame received (no payload)");
                            }
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            return Err(Error::WebSocket(e.to_string()));
                        }
                        None => {
                            tracing::info!("Channel stream ended");
                            return Ok(());
                        }
                        _ => {
                            // Binary, Pong, Frame -- ignore
                        }
                    }
                }
            }
        }
    }
}

/// Copy of the URL with the token query value blanked, for logging.
fn redacted(url: &Url) -> Url {
    let mut copy = url.clone();
    copy.query_pairs_mut().clear().append_pair("token", "***");
    copy
}

// ── Tests ────────────────────────────────────────────────────────────
