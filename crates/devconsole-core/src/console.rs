// ── Console facade ──
//
// The embedding application's entry point. `new` builds the transport
// clients so login works before anything is connected; `connect` wires
// the socket, subscription manager, watchdog, and bridge around a
// decision engine. One Console per device session.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::{Bridge, Dispatcher, EffectRouter};
use crate::config::{ConsoleConfig, TlsVerification};
use crate::engine::Engine;
use crate::error::CoreError;
use crate::event::Event;
use crate::subscription::{SubRequest, SubscriptionManager};
use crate::view::{ViewModel, ViewStream};
use crate::watchdog::Watchdog;
use devconsole_api::{
    AuthClient, HttpClient, SocketHandle, TlsMode, TransportConfig,
};

/// One device console session.
///
/// Construction order matters to callers: [`new`](Self::new), then
/// authenticate through [`auth`](Self::auth) (or [`login`](Self::login)),
/// then [`connect`](Self::connect) with the decision engine. Events flow
/// in through [`dispatch`](Self::dispatch) and state flows out through
/// [`view`](Self::view) / [`view_stream`](Self::view_stream).
pub struct Console {
    config: ConsoleConfig,
    auth: AuthClient,
    http: Arc<HttpClient>,
    dispatcher: Dispatcher,
    view_rx: watch::Receiver<ViewModel>,

    // Handed to the bridge at connect time.
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    view_tx: Mutex<Option<watch::Sender<ViewModel>>>,

    // Populated by connect.
    subscriptions: Mutex<Option<SubscriptionManager>>,
    bridge: Mutex<Option<Bridge>>,

    cancel: CancellationToken,
}

impl Console {
    /// Build the transport clients for a console. Nothing connects yet.
    pub fn new(config: ConsoleConfig) -> Result<Self, CoreError> {
        let transport = TransportConfig {
            tls: match &config.tls {
                TlsVerification::SystemDefaults => TlsMode::System,
                TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
                TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
            },
            timeout: config.http_timeout,
        };

        let auth = AuthClient::new(config.base_url.clone(), &transport)?;
        let http = Arc::new(HttpClient::new(config.base_url.clone(), &transport)?);

        let (dispatcher, event_rx) = Dispatcher::channel();
        let (view_tx, view_rx) = watch::channel(ViewModel::default());

        Ok(Self {
            config,
            auth,
            http,
            dispatcher,
            view_rx,
            event_rx: Mutex::new(Some(event_rx)),
            view_tx: Mutex::new(Some(view_tx)),
            subscriptions: Mutex::new(None),
            bridge: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// The token session shared by HTTP effects and the socket handshake.
    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Exchange credentials for a bearer token.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<(), CoreError> {
        self.auth.login(username, password).await?;
        Ok(())
    }

    /// Start the runtime around a decision engine.
    ///
    /// Spawns the socket, the subscription manager, and the bridge. Fails
    /// with [`CoreError::Internal`] if called twice.
    pub fn connect<E: Engine>(&self, engine: E) -> Result<(), CoreError> {
        let event_rx = self
            .event_rx
            .lock()
            .map_err(|_| CoreError::Internal("console lock poisoned".into()))?
            .take()
            .ok_or_else(|| CoreError::Internal("console already connected".into()))?;
        let view_tx = self
            .view_tx
            .lock()
            .map_err(|_| CoreError::Internal("console lock poisoned".into()))?
            .take()
            .ok_or_else(|| CoreError::Internal("console already connected".into()))?;

        info!(url = %self.config.base_url, "connecting console runtime");

        let socket = SocketHandle::connect(
            self.config.ws_url.clone(),
            self.auth.clone(),
            self.config.reconnect.clone(),
            self.cancel.child_token(),
        );

        let subscriptions = SubscriptionManager::start(
            socket,
            self.dispatcher.clone(),
            self.cancel.child_token(),
        );

        let watchdog = Watchdog::new(
            Arc::clone(&self.http),
            self.dispatcher.clone(),
            self.config.probe.clone(),
        );

        let router = EffectRouter {
            http: Arc::clone(&self.http),
            auth: self.auth.clone(),
            subscriptions: subscriptions.clone(),
            watchdog,
            http_deadline: self.config.http_timeout,
        };

        let bridge = Bridge::start(
            engine,
            router,
            event_rx,
            self.dispatcher.clone(),
            view_tx,
            self.cancel.child_token(),
        );

        if let Ok(mut slot) = self.subscriptions.lock() {
            *slot = Some(subscriptions);
        }
        if let Ok(mut slot) = self.bridge.lock() {
            *slot = Some(bridge);
        }
        Ok(())
    }

    /// Feed an event into the dispatch loop.
    pub fn dispatch(&self, event: Event) {
        self.dispatcher.dispatch(event);
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> ViewModel {
        self.view_rx.borrow().clone()
    }

    /// Stream of view snapshots, one per dispatch turn.
    pub fn view_stream(&self) -> ViewStream {
        ViewStream::new(self.view_rx.clone())
    }

    /// Tear the runtime down: drop subscriptions, stop every task, and
    /// wait for the bridge to finish its current turn.
    pub async fn shutdown(&self) {
        let subscriptions = self
            .subscriptions
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(subscriptions) = subscriptions {
            // Wait for the unsubscribe frames to reach the socket before
            // cancelling, so teardown is clean when the manager is alive.
            let (ack_tx, ack_rx) = oneshot::channel();
            subscriptions.request(SubRequest::UnsubscribeAll { ack: Some(ack_tx) });
            let _ = tokio::time::timeout(Duration::from_secs(1), ack_rx).await;
        }

        self.cancel.cancel();

        let bridge = self.bridge.lock().ok().and_then(|mut slot| slot.take());
        if let Some(bridge) = bridge {
            bridge.join().await;
        }
        info!("console shut down");
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEngine;

    impl Engine for NullEngine {
        type State = ();

        fn initial(&self) {}

        fn apply(&self, _state: &(), _event: &Event) -> ((), Vec<crate::effect::Effect>) {
            ((), Vec::new())
        }

        fn view(&self, _state: &()) -> ViewModel {
            ViewModel::default()
        }
    }

    #[tokio::test]
    async fn view_is_available_before_connect() {
        let console = Console::new(ConsoleConfig::default()).unwrap();
        assert_eq!(console.view(), ViewModel::default());
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let console = Console::new(ConsoleConfig::default()).unwrap();

        console.connect(NullEngine).unwrap();
        assert!(console.connect(NullEngine).is_err());

        console.shutdown().await;
    }
}
