// ── Effect vocabulary ──
//
// Effects are side-effect requests emitted by the decision engine and
// executed by the bridge. The engine never performs I/O itself; it asks
// for it here and hears back through Events.

use std::time::Duration;

use crate::event::{ChannelName, EffectId, TimerId};
use devconsole_api::Method;

/// A side-effect request from the decision engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    // ── HTTP ─────────────────────────────────────────────────────────
    /// Perform an HTTP request. Resolves as `HttpCompleted` (any status)
    /// or `HttpFailed` (transport-level failure) carrying `id`.
    Http {
        id: EffectId,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
    },

    // ── Pub/sub ──────────────────────────────────────────────────────
    /// Start live delivery for a channel. Idempotent: a no-op when the
    /// channel is already subscribing or subscribed.
    Subscribe { channel: ChannelName },

    /// Stop delivery for a channel. A no-op when never subscribed.
    Unsubscribe { channel: ChannelName },

    /// Drop every subscription (logout, navigation away).
    UnsubscribeAll,

    /// Fetch the most recent publications for a channel. Resolves as
    /// `HistoryFetched` carrying `id`, or `HttpFailed`.
    FetchHistory {
        id: EffectId,
        channel: ChannelName,
        limit: u32,
    },

    // ── Timers ───────────────────────────────────────────────────────
    /// Arm a cancellable timer. Re-arming an id restarts it.
    StartTimer { id: TimerId, delay: Duration },

    /// Disarm a timer. A no-op for unknown or already-fired ids.
    CancelTimer { id: TimerId },

    // ── Watchdog ─────────────────────────────────────────────────────
    /// Begin reachability polling after a disruptive operation. Replaces
    /// any watchdog already running.
    StartWatchdog,

    /// Stop reachability polling. A no-op when idle.
    CancelWatchdog,
}

impl Effect {
    /// The kind+target key used for stale-completion tracking.
    ///
    /// Two effects with the same key supersede each other: when a newer
    /// one is issued before the older resolves, the older completion is
    /// delivered with `stale: true`. Effects without a completion (or
    /// with their own cancel semantics, like timers) have no key.
    pub fn supersession_key(&self) -> Option<String> {
        match self {
            Self::Http { method, url, .. } => Some(format!("http:{method}:{url}")),
            Self::FetchHistory { channel, .. } => Some(format!("history:{channel}")),
            _ => None,
        }
    }

    /// The correlation id this effect resolves with, if any.
    pub fn effect_id(&self) -> Option<EffectId> {
        match self {
            Self::Http { id, .. } | Self::FetchHistory { id, .. } => Some(*id),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
