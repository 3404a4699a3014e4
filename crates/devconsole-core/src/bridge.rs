// ── Event/effect bridge ──
//
// The single-writer dispatch loop. Every event, from any source, funnels
// through one unbounded channel into one task that applies it to the
// engine, publishes the new view, and executes the returned effects.
// Events are therefore linearized: each one sees the state left by the
// previous one, and views never interleave mid-turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::effect::Effect;
use crate::engine::Engine;
use crate::event::{EffectId, Event, TimerId};
use crate::subscription::{SubRequest, SubscriptionManager};
use crate::view::ViewModel;
use crate::watchdog::Watchdog;
use devconsole_api::{AuthClient, HttpClient};

// ── Dispatcher ───────────────────────────────────────────────────────

/// Sender half of the event funnel. Cheap to clone; every event source
/// (UI, effect completions, socket, watchdog, timers) holds one.
#[derive(Clone)]
pub struct Dispatcher {
    event_tx: mpsc::UnboundedSender<Event>,
}

impl Dispatcher {
    /// Create a dispatcher and the receiver the bridge consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }

    /// Enqueue an event. Dropped with a warning after shutdown.
    pub fn dispatch(&self, event: Event) {
        if self.event_tx.send(event).is_err() {
            warn!("bridge stopped, event dropped");
        }
    }
}

// ── EffectRouter ─────────────────────────────────────────────────────

/// The transport handles effects are executed against.
pub struct EffectRouter {
    pub http: Arc<HttpClient>,
    pub auth: AuthClient,
    pub subscriptions: SubscriptionManager,
    pub watchdog: Watchdog,
    /// Per-request deadline for `Http` effects.
    pub http_deadline: Duration,
}

// ── Bridge ───────────────────────────────────────────────────────────

/// Handle to the running dispatch loop.
pub struct Bridge {
    task: JoinHandle<()>,
}

impl Bridge {
    /// Spawn the dispatch loop.
    ///
    /// The initial view is published before the first event is consumed,
    /// so observers never see a default `ViewModel` that the engine did
    /// not produce.
    pub fn start<E: Engine>(
        engine: E,
        router: EffectRouter,
        event_rx: mpsc::UnboundedReceiver<Event>,
        dispatcher: Dispatcher,
        view_tx: watch::Sender<ViewModel>,
        cancel: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(bridge_task(
            engine, router, event_rx, dispatcher, view_tx, cancel,
        ));
        Self { task }
    }

    /// Wait for the dispatch loop to finish after cancellation.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "bridge task panicked");
        }
    }
}

// ── Dispatch loop ────────────────────────────────────────────────────

async fn bridge_task<E: Engine>(
    engine: E,
    router: EffectRouter,
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    dispatcher: Dispatcher,
    view_tx: watch::Sender<ViewModel>,
    cancel: CancellationToken,
) {
    let mut state = engine.initial();
    let _ = view_tx.send(engine.view(&state));

    // Supersession tracking: `latest` maps a kind+target key to the most
    // recently issued effect id; `pending` maps an in-flight id back to
    // its key so completions can be classified in O(1).
    let mut latest: HashMap<String, EffectId> = HashMap::new();
    let mut pending: HashMap<EffectId, String> = HashMap::new();
    let mut timers: HashMap<TimerId, CancellationToken> = HashMap::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let event = classify(event, &mut latest, &mut pending, &mut timers);
        trace!(?event, "applying event");

        let (next, effects) = engine.apply(&state, &event);
        state = next;
        let _ = view_tx.send(engine.view(&state));

        for effect in effects {
            execute(effect, &router, &dispatcher, &mut latest, &mut pending, &mut timers);
        }
    }

    // Fire-and-forget tasks check their tokens; cancel what is left.
    for (_, token) in timers.drain() {
        token.cancel();
    }
    router.watchdog.cancel();
    debug!("bridge exiting");
}

/// Resolve bookkeeping a completed event implies: set the stale flag on
/// completions superseded by a newer same-key effect, and retire fired
/// timers.
fn classify(
    event: Event,
    latest: &mut HashMap<String, EffectId>,
    pending: &mut HashMap<EffectId, String>,
    timers: &mut HashMap<TimerId, CancellationToken>,
) -> Event {
    match event {
        Event::HttpCompleted {
            effect,
            status,
            body,
            ..
        } => {
            let stale = resolve_staleness(effect, latest, pending);
            Event::HttpCompleted {
                effect,
                status,
                body,
                stale,
            }
        }
        Event::HttpFailed { effect, error, .. } => {
            let stale = resolve_staleness(effect, latest, pending);
            Event::HttpFailed {
                effect,
                error,
                stale,
            }
        }
        Event::HistoryFetched {
            effect,
            channel,
            publications,
            ..
        } => {
            let stale = resolve_staleness(effect, latest, pending);
            Event::HistoryFetched {
                effect,
                channel,
                publications,
                stale,
            }
        }
        Event::TimerFired { id } => {
            timers.remove(&id);
            Event::TimerFired { id }
        }
        other => other,
    }
}

fn resolve_staleness(
    effect: EffectId,
    latest: &mut HashMap<String, EffectId>,
    pending: &mut HashMap<EffectId, String>,
) -> bool {
    let Some(key) = pending.remove(&effect) else {
        // Untracked completion (e.g. from the subscription manager for an
        // effect without a key); never stale.
        return false;
    };

    if latest.get(&key) == Some(&effect) {
        latest.remove(&key);
        false
    } else {
        true
    }
}

/// Execute one effect. Never blocks the dispatch loop: anything that
/// waits is spawned or handed to another task.
fn execute(
    effect: Effect,
    router: &EffectRouter,
    dispatcher: &Dispatcher,
    latest: &mut HashMap<String, EffectId>,
    pending: &mut HashMap<EffectId, String>,
    timers: &mut HashMap<TimerId, CancellationToken>,
) {
    if let (Some(key), Some(id)) = (effect.supersession_key(), effect.effect_id()) {
        latest.insert(key.clone(), id);
        pending.insert(id, key);
    }

    match effect {
        Effect::Http {
            id,
            method,
            url,
            body,
        } => {
            let http = Arc::clone(&router.http);
            let auth = router.auth.clone();
            let deadline = router.http_deadline;
            let dispatcher = dispatcher.clone();

            tokio::spawn(async move {
                let bearer = auth.bearer().await;
                let result = http
                    .perform(method, &url, body.as_ref(), bearer.as_deref(), deadline)
                    .await;

                match result {
                    Ok(outcome) => dispatcher.dispatch(Event::HttpCompleted {
                        effect: id,
                        status: outcome.status,
                        body: outcome.body,
                        stale: false,
                    }),
                    Err(e) => dispatcher.dispatch(Event::HttpFailed {
                        effect: id,
                        error: e.to_string(),
                        stale: false,
                    }),
                }
            });
        }

        Effect::Subscribe { channel } => {
            router.subscriptions.request(SubRequest::Subscribe(channel));
        }

        Effect::Unsubscribe { channel } => {
            router.subscriptions.request(SubRequest::Unsubscribe(channel));
        }

        Effect::UnsubscribeAll => {
            router
                .subscriptions
                .request(SubRequest::UnsubscribeAll { ack: None });
        }

        Effect::FetchHistory { id, channel, limit } => {
            router.subscriptions.request(SubRequest::History {
                effect: id,
                channel,
                limit,
            });
        }

        Effect::StartTimer { id, delay } => {
            // Re-arming restarts: the previous run is cancelled first.
            if let Some(previous) = timers.remove(&id) {
                previous.cancel();
            }

            let token = CancellationToken::new();
            timers.insert(id.clone(), token.clone());

            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        dispatcher.dispatch(Event::TimerFired { id });
                    }
                }
            });
        }

        Effect::CancelTimer { id } => {
            if let Some(token) = timers.remove(&id) {
                token.cancel();
            }
        }

        Effect::StartWatchdog => router.watchdog.start(),

        Effect::CancelWatchdog => router.watchdog.cancel(),
    }
}
