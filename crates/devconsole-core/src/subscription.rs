// ── Subscription manager ──
//
// Owns the desired-subscription set and reconciles it against the socket.
// New subscriptions go through backfill-then-live: the latest retained
// publication is fetched (history, limit 1) and dispatched with
// `replayed: true` *before* the subscribe frame goes out, so the engine
// always sees last-known state before any live delta. On reconnect the
// whole desired set is resynced the same way.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bridge::Dispatcher;
use crate::event::{ChannelName, EffectId, Event};
use crate::view::ConnectionState;
use devconsole_api::{Publication, SocketCommand, SocketHandle, SocketState};

const HISTORY_BACKFILL_LIMIT: u32 = 1;

// ── Desired-set bookkeeping ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    /// Wanted, but no backfill has run yet (socket was down).
    Subscribing,
    /// Backfill delivered and the subscribe frame sent.
    Subscribed,
}

/// Requests from the bridge.
#[derive(Debug)]
pub enum SubRequest {
    Subscribe(ChannelName),
    Unsubscribe(ChannelName),
    /// Drop every subscription. `ack` resolves once the unsubscribe
    /// frames have been handed to the socket, so shutdown can wait for
    /// a clean teardown before cancelling tasks.
    UnsubscribeAll {
        ack: Option<oneshot::Sender<()>>,
    },
    History {
        effect: EffectId,
        channel: ChannelName,
        limit: u32,
    },
}

// ── SubscriptionManager ──────────────────────────────────────────────

/// Handle to the manager task. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionManager {
    request_tx: mpsc::UnboundedSender<SubRequest>,
}

impl SubscriptionManager {
    /// Spawn the manager task over an established socket handle.
    pub fn start(
        socket: SocketHandle,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        tokio::spawn(manager_task(socket, dispatcher, request_rx, cancel));

        Self { request_tx }
    }

    pub fn request(&self, request: SubRequest) {
        if self.request_tx.send(request).is_err() {
            warn!("subscription manager stopped, request dropped");
        }
    }
}

// ── Manager task ─────────────────────────────────────────────────────

async fn manager_task(
    socket: SocketHandle,
    dispatcher: Dispatcher,
    mut request_rx: mpsc::UnboundedReceiver<SubRequest>,
    cancel: CancellationToken,
) {
    let mut channels: HashMap<ChannelName, SubscriptionState> = HashMap::new();
    let mut state_rx = socket.state();
    let mut publications = socket.publications();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                dispatch_connection_change(&dispatcher, &state);

                if state == SocketState::Connected {
                    resync(&socket, &dispatcher, &mut channels).await;
                }
            }

            publication = publications.recv() => {
                match publication {
                    Ok(publication) => {
                        forward_live(&dispatcher, &channels, &publication);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "publication stream lagged, messages dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            request = request_rx.recv() => {
                let Some(request) = request else { break };
                handle_request(&socket, &dispatcher, &mut channels, request).await;
            }
        }
    }

    debug!("subscription manager exiting");
}

fn dispatch_connection_change(dispatcher: &Dispatcher, state: &SocketState) {
    let (connection, reason) = match state {
        SocketState::Disconnected { reason } => (ConnectionState::Disconnected, *reason),
        SocketState::Connecting => (ConnectionState::Connecting, None),
        SocketState::Connected => (ConnectionState::Connected, None),
    };
    dispatcher.dispatch(Event::ConnectionChanged {
        state: connection,
        reason,
    });
}

/// Forward a live publication if its channel is in the desired set.
fn forward_live(
    dispatcher: &Dispatcher,
    channels: &HashMap<ChannelName, SubscriptionState>,
    publication: &Publication,
) {
    let channel = ChannelName::new(publication.channel.as_str());
    match channels.get(&channel) {
        Some(SubscriptionState::Subscribed) => {
            dispatcher.dispatch(Event::Publication {
                channel,
                payload: publication.payload.clone(),
                replayed: false,
            });
        }
        _ => {
            // Either unsubscribed meanwhile, or backfill has not completed
            // and ordering would be violated.
            trace!(channel = %channel, "dropping publication for inactive channel");
        }
    }
}

async fn handle_request(
    socket: &SocketHandle,
    dispatcher: &Dispatcher,
    channels: &mut HashMap<ChannelName, SubscriptionState>,
    request: SubRequest,
) {
    let connected = *socket.state().borrow() == SocketState::Connected;

    match request {
        SubRequest::Subscribe(channel) => {
            if channels.contains_key(&channel) {
                trace!(channel = %channel, "already subscribed, ignoring");
                return;
            }
            if connected {
                backfill_then_live(socket, dispatcher, channels, channel).await;
            } else {
                // Deferred until the next Connected transition.
                channels.insert(channel, SubscriptionState::Subscribing);
            }
        }

        SubRequest::Unsubscribe(channel) => {
            if channels.remove(&channel).is_none() {
                trace!(channel = %channel, "not subscribed, ignoring");
                return;
            }
            if connected {
                let _ = socket
                    .send(SocketCommand::Unsubscribe {
                        channel: channel.as_str().to_owned(),
                    })
                    .await;
            }
        }

        SubRequest::UnsubscribeAll { ack } => {
            for (channel, state) in channels.drain() {
                if connected && state == SubscriptionState::Subscribed {
                    let _ = socket
                        .send(SocketCommand::Unsubscribe {
                            channel: channel.as_str().to_owned(),
                        })
                        .await;
                }
            }
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }

        SubRequest::History {
            effect,
            channel,
            limit,
        } => {
            fetch_history(socket, dispatcher, effect, channel, limit).await;
        }
    }
}

/// Re-run backfill-then-live for every wanted channel after a reconnect.
async fn resync(
    socket: &SocketHandle,
    dispatcher: &Dispatcher,
    channels: &mut HashMap<ChannelName, SubscriptionState>,
) {
    let wanted: Vec<ChannelName> = channels.keys().cloned().collect();
    debug!(count = wanted.len(), "resyncing subscriptions");

    for channel in wanted {
        channels.remove(&channel);
        backfill_then_live(socket, dispatcher, channels, channel).await;
    }
}

/// History (limit 1) first, then the subscribe frame. The replayed
/// publication is dispatched before `Subscribed` is recorded, so no live
/// message can be forwarded ahead of it.
async fn backfill_then_live(
    socket: &SocketHandle,
    dispatcher: &Dispatcher,
    channels: &mut HashMap<ChannelName, SubscriptionState>,
    channel: ChannelName,
) {
    channels.insert(channel.clone(), SubscriptionState::Subscribing);

    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = socket
        .send(SocketCommand::History {
            channel: channel.as_str().to_owned(),
            limit: HISTORY_BACKFILL_LIMIT,
            reply: reply_tx,
        })
        .await;

    if sent.is_err() {
        // Socket task gone; the Subscribing entry survives for the next
        // Connected transition.
        return;
    }

    match reply_rx.await {
        Ok(Ok(publications)) => {
            for publication in publications {
                dispatcher.dispatch(Event::Publication {
                    channel: channel.clone(),
                    payload: publication.payload,
                    replayed: true,
                });
            }
        }
        Ok(Err(e)) => {
            debug!(channel = %channel, error = %e, "history backfill failed, will retry on reconnect");
            return;
        }
        Err(_) => return,
    }

    let subscribed = socket
        .send(SocketCommand::Subscribe {
            channel: channel.as_str().to_owned(),
        })
        .await;

    if subscribed.is_ok() {
        channels.insert(channel, SubscriptionState::Subscribed);
    }
}

/// Engine-requested history fetch, independent of the subscribe flow.
///
/// Resolves as one `HistoryFetched` completion carrying the effect id;
/// the bridge marks it stale if a newer fetch for the same channel was
/// issued meanwhile.
async fn fetch_history(
    socket: &SocketHandle,
    dispatcher: &Dispatcher,
    effect: EffectId,
    channel: ChannelName,
    limit: u32,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = socket
        .send(SocketCommand::History {
            channel: channel.as_str().to_owned(),
            limit,
            reply: reply_tx,
        })
        .await;

    if let Err(e) = sent {
        dispatcher.dispatch(Event::HttpFailed {
            effect,
            error: e.to_string(),
            stale: false,
        });
        return;
    }

    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        match reply_rx.await {
            Ok(Ok(publications)) => {
                dispatcher.dispatch(Event::HistoryFetched {
                    effect,
                    channel,
                    publications: publications.into_iter().map(|p| p.payload).collect(),
                    stale: false,
                });
            }
            Ok(Err(e)) => {
                dispatcher.dispatch(Event::HttpFailed {
                    effect,
                    error: e.to_string(),
                    stale: false,
                });
            }
            Err(_) => {
                dispatcher.dispatch(Event::HttpFailed {
                    effect,
                    error: "history request dropped".into(),
                    stale: false,
                });
            }
        }
    });
}
