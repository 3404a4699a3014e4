// ── Event vocabulary ──
//
// Events are the only way anything reaches the decision engine: user
// intents, effect completions, publications, timer fires, connection
// transitions. Immutable, consumed exactly once by the bridge.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::view::ConnectionState;
use devconsole_api::{DisconnectReason, HealthReport};

// ── Correlation ids ──────────────────────────────────────────────────

/// Correlation id for effects with an asynchronous completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectId(Uuid);

impl EffectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EffectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Versioned pub/sub channel name, e.g. `"NetworkStatusV1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ChannelName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Engine-chosen timer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(String);

impl TimerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TimerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ── Event ────────────────────────────────────────────────────────────

/// An intent or asynchronous completion fed to the decision engine.
///
/// Completion variants carry a `stale` flag: the bridge sets it when a
/// newer effect of the same kind and target was issued before this one
/// resolved. Stale completions are still delivered (auditability) -- the
/// engine decides whether to ignore them.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A user intent from the UI layer.
    UserAction {
        name: String,
        payload: serde_json::Value,
    },

    /// An `Http` effect resolved with a response. Any status code counts
    /// as completion; interpretation belongs to the engine.
    HttpCompleted {
        effect: EffectId,
        status: u16,
        body: serde_json::Value,
        stale: bool,
    },

    /// An `Http` or `FetchHistory` effect failed at the transport level.
    HttpFailed {
        effect: EffectId,
        error: String,
        stale: bool,
    },

    /// A message on a subscribed channel. `replayed` marks history
    /// backfill; the live stream never re-delivers a replayed message.
    Publication {
        channel: ChannelName,
        payload: serde_json::Value,
        replayed: bool,
    },

    /// A `FetchHistory` effect resolved with the channel's retained
    /// messages, newest last. Carries the effect's correlation id so a
    /// superseded fetch arrives marked stale like any other completion.
    HistoryFetched {
        effect: EffectId,
        channel: ChannelName,
        publications: Vec<serde_json::Value>,
        stale: bool,
    },

    /// A `StartTimer` effect elapsed without being cancelled.
    TimerFired { id: TimerId },

    /// The pub/sub connection changed state. `reason` is set on terminal
    /// disconnects (unauthorized, retries exhausted).
    ConnectionChanged {
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    },

    /// The watchdog observed the device down and then reachable again
    /// with a settled health report.
    WatchdogRecovered { report: HealthReport },

    /// The watchdog hit its ceiling without observing recovery.
    WatchdogTimedOut { after: Duration },
}

impl Event {
    /// Shorthand for a payload-less user action.
    pub fn user(name: impl Into<String>) -> Self {
        Self::UserAction {
            name: name.into(),
            payload: serde_json::Value::Null,
        }
    }
}
