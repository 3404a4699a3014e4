// Dispatch loop behavior: ordering, staleness, timers, view publication.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use devconsole_api::{
    AuthClient, HttpClient, Method, Publication, SocketCommand, SocketHandle, SocketState,
    TransportConfig,
};
use devconsole_core::bridge::{Bridge, Dispatcher, EffectRouter};
use devconsole_core::effect::Effect;
use devconsole_core::engine::Engine;
use devconsole_core::event::{EffectId, Event};
use devconsole_core::subscription::SubscriptionManager;
use devconsole_core::view::ViewModel;
use devconsole_core::watchdog::{ProbeConfig, Watchdog};

// ── Scriptable test engine ───────────────────────────────────────────

type Script = Box<dyn Fn(&Event) -> Vec<Effect> + Send + Sync>;

/// Counts turns, records every event it sees, and emits whatever the
/// script says.
struct ScriptEngine {
    seen: Arc<Mutex<Vec<Event>>>,
    script: Script,
}

impl ScriptEngine {
    fn new(script: Script) -> (Self, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                seen: Arc::clone(&seen),
                script,
            },
            seen,
        )
    }

    fn silent() -> (Self, Arc<Mutex<Vec<Event>>>) {
        Self::new(Box::new(|_| Vec::new()))
    }
}

impl Engine for ScriptEngine {
    type State = u64;

    fn initial(&self) -> u64 {
        0
    }

    fn apply(&self, state: &u64, event: &Event) -> (u64, Vec<Effect>) {
        self.seen.lock().unwrap().push(event.clone());
        (state + 1, (self.script)(event))
    }

    fn view(&self, state: &u64) -> ViewModel {
        let mut view = ViewModel::default();
        view.channels.insert("turns".into(), json!(*state));
        view
    }
}

// ── Harness ──────────────────────────────────────────────────────────

/// Fake socket endpoints kept alive for the duration of a test.
struct SocketParts {
    command_rx: mpsc::Receiver<SocketCommand>,
    _publication_tx: broadcast::Sender<Arc<Publication>>,
    _state_tx: watch::Sender<SocketState>,
}

struct Harness {
    dispatcher: Dispatcher,
    view_rx: watch::Receiver<ViewModel>,
    cancel: CancellationToken,
    socket: SocketParts,
    _bridge: Bridge,
}

fn start_bridge(engine: ScriptEngine, base_url: &str) -> Harness {
    let base: url::Url = base_url.parse().expect("base url");
    let transport = TransportConfig::default();
    let http = Arc::new(HttpClient::new(base.clone(), &transport).expect("http client"));
    let auth = AuthClient::new(base, &transport).expect("auth client");

    let (command_tx, command_rx) = mpsc::channel(16);
    let (publication_tx, _) = broadcast::channel(16);
    let (state_tx, state_rx) = watch::channel(SocketState::Disconnected { reason: None });
    let socket = SocketHandle::from_parts(
        command_tx,
        publication_tx.clone(),
        state_rx,
        CancellationToken::new(),
    );

    let (dispatcher, event_rx) = Dispatcher::channel();
    let cancel = CancellationToken::new();

    let subscriptions =
        SubscriptionManager::start(socket, dispatcher.clone(), cancel.child_token());
    let watchdog = Watchdog::new(
        Arc::clone(&http),
        dispatcher.clone(),
        ProbeConfig::default(),
    );

    let router = EffectRouter {
        http,
        auth,
        subscriptions,
        watchdog,
        http_deadline: Duration::from_secs(5),
    };

    let (view_tx, view_rx) = watch::channel(ViewModel::default());
    let bridge = Bridge::start(
        engine,
        router,
        event_rx,
        dispatcher.clone(),
        view_tx,
        cancel.child_token(),
    );

    Harness {
        dispatcher,
        view_rx,
        cancel,
        socket: SocketParts {
            command_rx,
            _publication_tx: publication_tx,
            _state_tx: state_tx,
        },
        _bridge: bridge,
    }
}

async fn next_socket_command(harness: &mut Harness) -> SocketCommand {
    tokio::time::timeout(Duration::from_secs(5), harness.socket.command_rx.recv())
        .await
        .expect("expected a socket command")
        .expect("command channel open")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within deadline");
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn events_apply_in_dispatch_order() {
    let (engine, seen) = ScriptEngine::silent();
    let harness = start_bridge(engine, "https://127.0.0.1:1/");

    for i in 0..10 {
        harness.dispatcher.dispatch(Event::user(format!("action-{i}")));
    }

    wait_until(|| seen.lock().unwrap().len() == 10).await;

    let seen = seen.lock().unwrap();
    for (i, event) in seen.iter().enumerate() {
        match event {
            Event::UserAction { name, .. } => assert_eq!(name, &format!("action-{i}")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    harness.cancel.cancel();
}

#[tokio::test]
async fn initial_view_is_engine_produced() {
    let (engine, _seen) = ScriptEngine::silent();
    let mut harness = start_bridge(engine, "https://127.0.0.1:1/");

    // The first published view comes from the engine, not Default.
    harness.view_rx.changed().await.expect("bridge alive");
    assert_eq!(harness.view_rx.borrow().channels["turns"], json!(0));

    harness.cancel.cancel();
}

#[tokio::test]
async fn view_reflects_each_completed_turn() {
    let (engine, seen) = ScriptEngine::silent();
    let harness = start_bridge(engine, "https://127.0.0.1:1/");

    harness.dispatcher.dispatch(Event::user("a"));
    harness.dispatcher.dispatch(Event::user("b"));

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    wait_until(|| harness.view_rx.borrow().channels["turns"] == json!(2)).await;

    harness.cancel.cancel();
}

#[tokio::test]
async fn http_effect_resolves_as_completion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/device/network"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "link": "up" })))
        .mount(&server)
        .await;

    let id = EffectId::new();
    let (engine, seen) = ScriptEngine::new(Box::new(move |event| match event {
        Event::UserAction { .. } => vec![Effect::Http {
            id,
            method: Method::GET,
            url: "device/network".into(),
            body: None,
        }],
        _ => Vec::new(),
    }));
    let harness = start_bridge(engine, &server.uri());

    harness.dispatcher.dispatch(Event::user("fetch"));

    wait_until(|| {
        seen.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::HttpCompleted { .. }))
    })
    .await;

    let seen = seen.lock().unwrap();
    let completion = seen
        .iter()
        .find_map(|e| match e {
            Event::HttpCompleted { effect, status, body, stale } => {
                Some((*effect, *status, body.clone(), *stale))
            }
            _ => None,
        })
        .expect("completion recorded");

    assert_eq!(completion.0, id);
    assert_eq!(completion.1, 200);
    assert_eq!(completion.2["link"], "up");
    assert!(!completion.3);

    harness.cancel.cancel();
}

#[tokio::test]
async fn non_2xx_status_is_a_completion_not_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/device/network"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "error": "rebooting" })))
        .mount(&server)
        .await;

    let id = EffectId::new();
    let (engine, seen) = ScriptEngine::new(Box::new(move |event| match event {
        Event::UserAction { .. } => vec![Effect::Http {
            id,
            method: Method::GET,
            url: "device/network".into(),
            body: None,
        }],
        _ => Vec::new(),
    }));
    let harness = start_bridge(engine, &server.uri());

    harness.dispatcher.dispatch(Event::user("fetch"));

    wait_until(|| seen.lock().unwrap().len() == 2).await;

    let seen = seen.lock().unwrap();
    match &seen[1] {
        Event::HttpCompleted { status, .. } => assert_eq!(*status, 503),
        other => panic!("expected completion with 503, got {other:?}"),
    }

    harness.cancel.cancel();
}

#[tokio::test]
async fn superseded_completion_is_marked_stale() {
    let server = MockServer::start().await;
    // First request is slow; the second, issued meanwhile, is fast.
    Mock::given(method("GET"))
        .and(path("/device/network"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "age": "old" }))
                .set_delay(Duration::from_millis(300)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/device/network"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "age": "new" })))
        .mount(&server)
        .await;

    let first = EffectId::new();
    let second = EffectId::new();
    let (engine, seen) = ScriptEngine::new(Box::new(move |event| match event {
        Event::UserAction { name, .. } => {
            let id = if name == "first" { first } else { second };
            vec![Effect::Http {
                id,
                method: Method::GET,
                url: "device/network".into(),
                body: None,
            }]
        }
        _ => Vec::new(),
    }));
    let harness = start_bridge(engine, &server.uri());

    harness.dispatcher.dispatch(Event::user("first"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.dispatcher.dispatch(Event::user("second"));

    wait_until(|| {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::HttpCompleted { .. }))
            .count()
            == 2
    })
    .await;

    let seen = seen.lock().unwrap();
    for event in seen.iter() {
        if let Event::HttpCompleted { effect, stale, .. } = event {
            if *effect == first {
                assert!(*stale, "superseded completion must be stale");
            } else {
                assert!(!*stale, "newest completion must not be stale");
            }
        }
    }

    harness.cancel.cancel();
}

#[tokio::test]
async fn transport_failure_resolves_as_http_failed() {
    let id = EffectId::new();
    let (engine, seen) = ScriptEngine::new(Box::new(move |event| match event {
        Event::UserAction { .. } => vec![Effect::Http {
            id,
            method: Method::GET,
            url: "device/network".into(),
            body: None,
        }],
        _ => Vec::new(),
    }));
    // Nothing listens on the discard port; the connect is refused.
    let harness = start_bridge(engine, "http://127.0.0.1:9/");

    harness.dispatcher.dispatch(Event::user("fetch"));

    wait_until(|| {
        seen.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::HttpFailed { .. }))
    })
    .await;

    let seen = seen.lock().unwrap();
    match seen
        .iter()
        .find(|e| matches!(e, Event::HttpFailed { .. }))
        .expect("failure recorded")
    {
        Event::HttpFailed { effect, error, stale } => {
            assert_eq!(*effect, id);
            assert!(!error.is_empty());
            assert!(!*stale);
        }
        _ => unreachable!(),
    }

    harness.cancel.cancel();
}

#[tokio::test]
async fn superseded_history_fetch_is_marked_stale() {
    let first = EffectId::new();
    let second = EffectId::new();
    let (engine, seen) = ScriptEngine::new(Box::new(move |event| match event {
        Event::UserAction { name, .. } => {
            let id = if name == "first" { first } else { second };
            vec![Effect::FetchHistory {
                id,
                channel: "NetworkStatusV1".into(),
                limit: 1,
            }]
        }
        _ => Vec::new(),
    }));
    let mut harness = start_bridge(engine, "https://127.0.0.1:1/");

    harness.dispatcher.dispatch(Event::user("first"));
    let reply_first = match next_socket_command(&mut harness).await {
        SocketCommand::History { reply, .. } => reply,
        other => panic!("expected history command, got {other:?}"),
    };

    harness.dispatcher.dispatch(Event::user("second"));
    let reply_second = match next_socket_command(&mut harness).await {
        SocketCommand::History { reply, .. } => reply,
        other => panic!("expected history command, got {other:?}"),
    };

    // The newer fetch resolves first; the superseded one trickles in late.
    reply_second
        .send(Ok(vec![Publication {
            channel: "NetworkStatusV1".into(),
            payload: json!({ "age": "new" }),
            at: None,
        }]))
        .expect("reply receiver alive");
    reply_first
        .send(Ok(vec![Publication {
            channel: "NetworkStatusV1".into(),
            payload: json!({ "age": "old" }),
            at: None,
        }]))
        .expect("reply receiver alive");

    wait_until(|| {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::HistoryFetched { .. }))
            .count()
            == 2
    })
    .await;

    let seen = seen.lock().unwrap();
    for event in seen.iter() {
        if let Event::HistoryFetched {
            effect,
            publications,
            stale,
            ..
        } = event
        {
            if *effect == first {
                assert!(*stale, "superseded history fetch must be stale");
                assert_eq!(publications[0]["age"], "old");
            } else {
                assert_eq!(*effect, second);
                assert!(!*stale, "newest history fetch must not be stale");
                assert_eq!(publications[0]["age"], "new");
            }
        }
    }

    harness.cancel.cancel();
}

#[tokio::test]
async fn timer_fires_after_delay() {
    let (engine, seen) = ScriptEngine::new(Box::new(|event| match event {
        Event::UserAction { .. } => vec![Effect::StartTimer {
            id: "poll".into(),
            delay: Duration::from_millis(50),
        }],
        _ => Vec::new(),
    }));
    let harness = start_bridge(engine, "https://127.0.0.1:1/");

    harness.dispatcher.dispatch(Event::user("arm"));

    wait_until(|| {
        seen.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::TimerFired { id } if id.as_str() == "poll"))
    })
    .await;

    harness.cancel.cancel();
}

#[tokio::test]
async fn cancelled_timer_never_fires() {
    let (engine, seen) = ScriptEngine::new(Box::new(|event| match event {
        Event::UserAction { name, .. } if name == "arm" => vec![Effect::StartTimer {
            id: "poll".into(),
            delay: Duration::from_millis(100),
        }],
        Event::UserAction { name, .. } if name == "disarm" => {
            vec![Effect::CancelTimer { id: "poll".into() }]
        }
        _ => Vec::new(),
    }));
    let harness = start_bridge(engine, "https://127.0.0.1:1/");

    harness.dispatcher.dispatch(Event::user("arm"));
    harness.dispatcher.dispatch(Event::user("disarm"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !seen
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::TimerFired { .. })),
        "cancelled timer fired anyway"
    );

    harness.cancel.cancel();
}

#[tokio::test]
async fn rearming_a_timer_restarts_it() {
    let (engine, seen) = ScriptEngine::new(Box::new(|event| match event {
        Event::UserAction { .. } => vec![Effect::StartTimer {
            id: "poll".into(),
            delay: Duration::from_millis(80),
        }],
        _ => Vec::new(),
    }));
    let harness = start_bridge(engine, "https://127.0.0.1:1/");

    harness.dispatcher.dispatch(Event::user("arm"));
    tokio::time::sleep(Duration::from_millis(40)).await;
    harness.dispatcher.dispatch(Event::user("arm"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let fired = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::TimerFired { .. }))
        .count();
    assert_eq!(fired, 1, "re-arming must replace the pending timer");

    harness.cancel.cancel();
}
