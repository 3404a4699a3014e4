//! Pub/sub WebSocket with auto-reconnect.
//!
//! Connects to the console's publish/subscribe endpoint and exposes three
//! channel surfaces: an mpsc command channel for subscribe/unsubscribe and
//! history requests, a [`tokio::sync::broadcast`] fan-out of live
//! publications, and a [`tokio::sync::watch`] of the connection state.
//! Reconnection with exponential backoff + jitter is handled here; the
//! subscription manager upstairs only reacts to `Connected` transitions.
//!
//! Authentication is a bearer token on the upgrade request. An auth
//! challenge during the handshake triggers one token refresh and retry;
//! a second challenge is terminal and surfaces as
//! `Disconnected { reason: Unauthorized }`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::auth::AuthClient;
use crate::error::Error;

// ── Channel capacities ───────────────────────────────────────────────

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const PUBLICATION_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type HistoryReply = oneshot::Sender<Result<Vec<Publication>, Error>>;

// ── Wire types ───────────────────────────────────────────────────────

/// A single message published on a named channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Publication {
    /// Versioned channel name, e.g. `"NetworkStatusV1"`.
    pub channel: String,

    /// Channel-specific payload; opaque to this layer.
    pub payload: serde_json::Value,

    /// Server-side publication timestamp, if the server sends one.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// Frames the client sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    History { id: u64, channel: String, limit: u32 },
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServerFrame {
    Publication(Publication),
    History { id: u64, publications: Vec<Publication> },
    Error { message: String },
}

// ── Public command surface ───────────────────────────────────────────

/// Commands accepted by the socket task.
#[derive(Debug)]
pub enum SocketCommand {
    /// Start receiving live publications for a channel.
    Subscribe { channel: String },
    /// Stop receiving publications for a channel.
    Unsubscribe { channel: String },
    /// Fetch the most recent publications for a channel. The reply
    /// resolves when the server answers or the connection drops.
    History {
        channel: String,
        limit: u32,
        reply: HistoryReply,
    },
}

// ── Connection state ─────────────────────────────────────────────────

/// Socket connection state, observable through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketState {
    Disconnected { reason: Option<DisconnectReason> },
    Connecting,
    Connected,
}

/// Why the socket gave up, when it did so terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Auth challenge survived a token refresh; the session is dead.
    Unauthorized,
    /// `ReconnectConfig::max_retries` exhausted.
    RetriesExhausted,
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── SocketHandle ─────────────────────────────────────────────────────

/// Handle to the running socket task.
///
/// Cheaply cloneable. All clones share one connection; this is the
/// process-wide singleton the subscription manager owns.
#[derive(Clone)]
pub struct SocketHandle {
    command_tx: mpsc::Sender<SocketCommand>,
    publication_tx: broadcast::Sender<Arc<Publication>>,
    state_rx: watch::Receiver<SocketState>,
    cancel: CancellationToken,
}

impl SocketHandle {
    /// Spawn the socket task and return a handle to it.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background. Observe [`state`](Self::state) for progress.
    pub fn connect(
        ws_url: Url,
        auth: AuthClient,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (publication_tx, _) = broadcast::channel(PUBLICATION_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SocketState::Disconnected { reason: None });

        let task_cancel = cancel.clone();
        let task_publication_tx = publication_tx.clone();
        tokio::spawn(async move {
            socket_loop(
                ws_url,
                auth,
                reconnect,
                task_cancel,
                command_rx,
                task_publication_tx,
                state_tx,
            )
            .await;
        });

        Self {
            command_tx,
            publication_tx,
            state_rx,
            cancel,
        }
    }

    /// Assemble a handle from raw channel endpoints.
    ///
    /// No socket task is spawned; the caller owns the other ends. Used by
    /// in-process fakes in tests.
    pub fn from_parts(
        command_tx: mpsc::Sender<SocketCommand>,
        publication_tx: broadcast::Sender<Arc<Publication>>,
        state_rx: watch::Receiver<SocketState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            command_tx,
            publication_tx,
            state_rx,
            cancel,
        }
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<SocketState> {
        self.state_rx.clone()
    }

    /// Get a new receiver for the live publication stream.
    pub fn publications(&self) -> broadcast::Receiver<Arc<Publication>> {
        self.publication_tx.subscribe()
    }

    /// Send a command to the socket task.
    pub async fn send(&self, command: SocketCommand) -> Result<(), Error> {
        self.command_tx.send(command).await.map_err(|_| {
            Error::WebSocketClosed {
                reason: "socket task stopped".into(),
            }
        })
    }

    /// Signal the socket task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

enum ConnectError {
    /// Server rejected the upgrade with 401/403.
    AuthChallenge,
    Failed(Error),
}

/// Main loop: connect → serve → on error, backoff → reconnect.
async fn socket_loop(
    ws_url: Url,
    auth: AuthClient,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    mut command_rx: mpsc::Receiver<SocketCommand>,
    publication_tx: broadcast::Sender<Arc<Publication>>,
    state_tx: watch::Sender<SocketState>,
) {
    let mut attempt: u32 = 0;
    let mut refreshed_once = false;
    let mut next_request_id: u64 = 0;

    loop {
        let _ = state_tx.send(SocketState::Connecting);

        let established = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = establish(&ws_url, &auth) => result,
        };

        match established {
            Ok(stream) => {
                info!(url = %ws_url, "WebSocket connected");
                let _ = state_tx.send(SocketState::Connected);
                attempt = 0;
                refreshed_once = false;

                let result = run_connection(
                    stream,
                    &mut command_rx,
                    &publication_tx,
                    &cancel,
                    &mut next_request_id,
                )
                .await;

                if cancel.is_cancelled() {
                    break;
                }
                let _ = state_tx.send(SocketState::Disconnected { reason: None });

                match result {
                    // Clean disconnect: reconnect immediately.
                    Ok(()) => info!("WebSocket disconnected cleanly, reconnecting"),
                    Err(e) => {
                        warn!(error = %e, attempt, "WebSocket dropped");
                        if !backoff_wait(attempt, &reconnect, &cancel).await {
                            break;
                        }
                        attempt = attempt.saturating_add(1);
                    }
                }
            }

            Err(ConnectError::AuthChallenge) => {
                if refreshed_once || auth.refresh().await.is_err() {
                    warn!("WebSocket auth challenge survived token refresh, giving up");
                    let _ = state_tx.send(SocketState::Disconnected {
                        reason: Some(DisconnectReason::Unauthorized),
                    });
                    break;
                }
                debug!("WebSocket auth challenge, retrying with refreshed token");
                refreshed_once = true;
            }

            Err(ConnectError::Failed(e)) => {
                warn!(error = %e, attempt, "WebSocket connect failed");
                let _ = state_tx.send(SocketState::Disconnected { reason: None });

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        warn!(max_retries = max, "WebSocket reconnection limit reached");
                        let _ = state_tx.send(SocketState::Disconnected {
                            reason: Some(DisconnectReason::RetriesExhausted),
                        });
                        break;
                    }
                }

                if !backoff_wait(attempt, &reconnect, &cancel).await {
                    break;
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }

    debug!("WebSocket loop exiting");
}

/// Attempt one upgrade with the current bearer token.
async fn establish(url: &Url, auth: &AuthClient) -> Result<WsStream, ConnectError> {
    debug!(url = %url, "connecting to WebSocket");

    let uri: tungstenite::http::Uri = url.as_str().parse().map_err(
        |e: tungstenite::http::uri::InvalidUri| {
            ConnectError::Failed(Error::WebSocketConnect(e.to_string()))
        },
    )?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(token) = auth.bearer().await {
        request = request.with_header("Authorization", format!("Bearer {token}"));
    }

    match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => Ok(stream),
        Err(tungstenite::Error::Http(response))
            if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED
                || response.status() == tungstenite::http::StatusCode::FORBIDDEN =>
        {
            Err(ConnectError::AuthChallenge)
        }
        Err(e) => Err(ConnectError::Failed(Error::WebSocketConnect(e.to_string()))),
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Serve one established connection until it drops.
///
/// Commands are encoded and written out; inbound frames are routed to the
/// publication broadcast or matched to a pending history request by id.
/// On exit, all in-flight history requests are failed so callers never hang.
async fn run_connection(
    stream: WsStream,
    command_rx: &mut mpsc::Receiver<SocketCommand>,
    publication_tx: &broadcast::Sender<Arc<Publication>>,
    cancel: &CancellationToken,
    next_request_id: &mut u64,
) -> Result<(), Error> {
    let (mut write, mut read) = stream.split();
    let mut pending: HashMap<u64, HistoryReply> = HashMap::new();

    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),

            command = command_rx.recv() => {
                let Some(command) = command else { break Ok(()) };
                let frame = match command {
                    SocketCommand::Subscribe { channel } => ClientFrame::Subscribe { channel },
                    SocketCommand::Unsubscribe { channel } => ClientFrame::Unsubscribe { channel },
                    SocketCommand::History { channel, limit, reply } => {
                        *next_request_id += 1;
                        pending.insert(*next_request_id, reply);
                        ClientFrame::History { id: *next_request_id, channel, limit }
                    }
                };
                // Frame types are plain data; serialization cannot fail.
                let text = serde_json::to_string(&frame).unwrap_or_default();
                if let Err(e) = write.send(Message::text(text)).await {
                    break Err(Error::WebSocketConnect(e.to_string()));
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(text.as_str(), publication_tx, &mut pending);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite answers pongs automatically
                        trace!("WebSocket ping");
                    }
                    Some(Ok(Message::Close(close))) => {
                        if let Some(ref cf) = close {
                            info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame");
                        } else {
                            info!("WebSocket close frame (no payload)");
                        }
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(Error::WebSocketConnect(e.to_string())),
                    None => {
                        info!("WebSocket stream ended");
                        break Ok(());
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(Error::WebSocketClosed {
            reason: "connection dropped".into(),
        }));
    }

    result
}

/// Route one inbound text frame.
fn handle_frame(
    text: &str,
    publication_tx: &broadcast::Sender<Arc<Publication>>,
    pending: &mut HashMap<u64, HistoryReply>,
) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "unparseable server frame, skipping");
            return;
        }
    };

    match frame {
        ServerFrame::Publication(publication) => {
            // Send errors just mean no subscribers right now
            let _ = publication_tx.send(Arc::new(publication));
        }
        ServerFrame::History { id, publications } => match pending.remove(&id) {
            Some(reply) => {
                let _ = reply.send(Ok(publications));
            }
            None => debug!(id, "history reply with no pending request"),
        },
        ServerFrame::Error { message } => {
            warn!(%message, "server reported error");
        }
    }
}

// ── Backoff ──────────────────────────────────────────────────────────

/// Sleep out the backoff delay. Returns `false` if cancelled mid-wait.
async fn backoff_wait(attempt: u32, config: &ReconnectConfig, cancel: &CancellationToken) -> bool {
    let delay = calculate_backoff(attempt, config);
    debug!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * jitter`, jitter in [0.85, 1.15)
/// keyed off the attempt number. Deterministic, which is plenty to spread
/// reconnect storms without pulling in a rand dependency.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(16) as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter = 0.85 + 0.30 * f64::from(attempt.wrapping_mul(2_654_435_761) % 1000) / 1000.0;

    Duration::from_secs_f64(capped * jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
