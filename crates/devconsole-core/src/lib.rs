// devconsole-core: the Core/Shell synchronization runtime.
//
// A decision engine (the Core) is pure and synchronous; this crate is the
// Shell around it. Events funnel through a single dispatch loop into the
// engine, effects come back out and are executed against the transports
// in devconsole-api, and each turn's state is projected into a ViewModel
// for rendering. On top of that sit the resilient pub/sub subscription
// manager and the post-operation health watchdog.

pub mod bridge;
pub mod config;
pub mod console;
pub mod effect;
pub mod engine;
pub mod error;
pub mod event;
pub mod subscription;
pub mod view;
pub mod watchdog;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{Bridge, Dispatcher, EffectRouter};
pub use config::{ConsoleConfig, TlsVerification};
pub use console::Console;
pub use effect::Effect;
pub use engine::Engine;
pub use error::CoreError;
pub use event::{ChannelName, EffectId, Event, TimerId};
pub use subscription::{SubRequest, SubscriptionManager};
pub use view::{ConnectionState, Notice, RedirectTarget, Severity, ViewModel, ViewStream};
pub use watchdog::{ProbeConfig, Watchdog};

// Transport-level types engines and embedders also need.
pub use devconsole_api::{DisconnectReason, HealthReport, Method, ReconnectConfig};
