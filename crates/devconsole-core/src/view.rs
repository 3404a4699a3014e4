// ── View projection ──
//
// The ViewModel is the read-only snapshot rendering code observes. The
// bridge replaces it wholesale once per turn through a watch channel, so
// readers always see the result of the most recently completed turn and
// never a half-applied state.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

// ── ConnectionState ──────────────────────────────────────────────────

/// Pub/sub connection state as the engine and views see it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

// ── ViewModel ────────────────────────────────────────────────────────

/// Immutable-per-turn snapshot of engine state for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewModel {
    pub connection: ConnectionState,

    /// True while an operation the user should wait on is in flight.
    pub busy: bool,

    /// The single success/error message slot. A new notice always
    /// replaces the previous one; notices never queue.
    pub notice: Option<Notice>,

    /// Set when a network change reported a new reachable address; the
    /// UI offers to open it in a new browsing context.
    pub redirect: Option<RedirectTarget>,

    /// Latest known payload per subscribed channel.
    pub channels: BTreeMap<String, serde_json::Value>,
}

/// A user-visible message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub severity: Severity,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Error,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self { severity: Severity::Info, text: text.into() }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self { severity: Severity::Success, text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { severity: Severity::Error, text: text.into() }
    }
}

/// Address and port to offer after a network reconfiguration moved the
/// device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectTarget {
    pub host: String,
    pub port: u16,
}

// ── ViewStream ───────────────────────────────────────────────────────

/// `Stream` adapter over the ViewModel watch channel.
///
/// Yields a fresh snapshot each turn, starting with the current one. For
/// use with `StreamExt` combinators in embedding code.
pub struct ViewStream {
    inner: WatchStream<ViewModel>,
}

impl ViewStream {
    pub(crate) fn new(receiver: watch::Receiver<ViewModel>) -> Self {
        Self {
            inner: WatchStream::new(receiver),
        }
    }
}

impl Stream for ViewStream {
    type Item = ViewModel;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn view_stream_yields_current_snapshot_then_updates() {
        let (tx, rx) = watch::channel(ViewModel::default());
        let mut stream = ViewStream::new(rx);

        // The stream starts with whatever the channel currently holds.
        let first = stream.next().await.unwrap();
        assert_eq!(first, ViewModel::default());

        let mut updated = ViewModel::default();
        updated.busy = true;
        updated.notice = Some(Notice::success("rebooted"));
        tx.send(updated.clone()).unwrap();

        let second = stream.next().await.unwrap();
        assert_eq!(second, updated);
    }

    #[tokio::test]
    async fn view_stream_ends_when_writer_drops() {
        let (tx, rx) = watch::channel(ViewModel::default());
        let mut stream = ViewStream::new(rx);

        let _ = stream.next().await;
        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
