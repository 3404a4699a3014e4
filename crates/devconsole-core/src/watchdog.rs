// ── Health watchdog ──
//
// Bounded reachability polling after a disruptive operation (reboot,
// factory reset, firmware update, network reconfiguration). The device
// must be observed *down* at least once before an observed *up* counts
// as recovery -- otherwise a probe that never left reachability would
// declare a reboot recovered before it even started.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::Dispatcher;
use crate::event::Event;
use devconsole_api::HttpClient;

// ── ProbeConfig ──────────────────────────────────────────────────────

/// Polling cadence for the watchdog.
///
/// `request_timeout` bounds each probe individually and must stay below
/// `interval` so a single stuck request cannot stall the cadence.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Time between probes. Default: 5s.
    pub interval: Duration,

    /// Per-probe deadline. Default: 2.5s.
    pub request_timeout: Duration,

    /// Give up after this long without recovery. Default: 300s.
    pub ceiling: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            request_timeout: Duration::from_millis(2500),
            ceiling: Duration::from_secs(300),
        }
    }
}

// ── Watchdog ─────────────────────────────────────────────────────────

/// Singleton reachability poller.
///
/// One watchdog exists per console; starting it while a run is active
/// cancels the previous run first, so timers never leak. Outcomes are
/// dispatched as [`Event::WatchdogRecovered`] or
/// [`Event::WatchdogTimedOut`], exactly one per run.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

struct WatchdogInner {
    http: Arc<HttpClient>,
    dispatcher: Dispatcher,
    probe: ProbeConfig,
    active: Mutex<Option<CancellationToken>>,
}

impl Watchdog {
    pub fn new(http: Arc<HttpClient>, dispatcher: Dispatcher, probe: ProbeConfig) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                http,
                dispatcher,
                probe,
                active: Mutex::new(None),
            }),
        }
    }

    /// Begin polling. Replaces any active run.
    pub fn start(&self) {
        let token = CancellationToken::new();

        let previous = match self.inner.active.lock() {
            Ok(mut active) => active.replace(token.clone()),
            Err(poisoned) => poisoned.into_inner().replace(token.clone()),
        };
        if let Some(previous) = previous {
            debug!("replacing active watchdog run");
            previous.cancel();
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            poll_task(
                Arc::clone(&inner.http),
                inner.dispatcher.clone(),
                inner.probe.clone(),
                token,
            )
            .await;
        });
    }

    /// Stop polling. A no-op when idle.
    pub fn cancel(&self) {
        let taken = match self.inner.active.lock() {
            Ok(mut active) => active.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(token) = taken {
            debug!("watchdog cancelled");
            token.cancel();
        }
    }
}

// ── Poll loop ────────────────────────────────────────────────────────

async fn poll_task(
    http: Arc<HttpClient>,
    dispatcher: Dispatcher,
    probe: ProbeConfig,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + probe.ceiling;
    let mut was_unreachable_once = false;

    let mut ticker = tokio::time::interval(probe.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_ms = probe.interval.as_millis() as u64,
        ceiling_ms = probe.ceiling.as_millis() as u64,
        "watchdog started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,

            _ = tokio::time::sleep_until(deadline) => {
                warn!("watchdog ceiling reached without recovery");
                dispatcher.dispatch(Event::WatchdogTimedOut { after: probe.ceiling });
                return;
            }

            _ = ticker.tick() => {
                match http.healthcheck(probe.request_timeout).await {
                    Ok(report) => {
                        if was_unreachable_once && report.is_settled() {
                            info!("device recovered");
                            dispatcher.dispatch(Event::WatchdogRecovered { report });
                            return;
                        }
                        // Reachable but either never seen down or still
                        // mid-validation -- keep polling.
                        debug!(
                            was_unreachable_once,
                            settled = report.is_settled(),
                            "probe succeeded, not terminal yet"
                        );
                    }
                    Err(e) => {
                        debug!(error = %e, "probe failed");
                        was_unreachable_once = true;
                    }
                }
            }
        }
    }
}
