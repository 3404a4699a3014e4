// ── Runtime connection configuration ──
//
// These types describe *how* to reach the device console. They carry
// connection tuning only and never touch disk -- the embedding
// application constructs a `ConsoleConfig` and hands it in.

use std::time::Duration;

use url::Url;

use crate::watchdog::ProbeConfig;
use devconsole_api::ReconnectConfig;

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification. Default: device consoles ship self-signed certs.
    #[default]
    DangerAcceptInvalid,
}

/// Configuration for one console session.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Console base URL (e.g., `https://192.168.1.1`).
    pub base_url: Url,
    /// Pub/sub WebSocket URL (e.g., `wss://192.168.1.1/pubsub`).
    pub ws_url: Url,
    /// TLS verification strategy.
    pub tls: TlsVerification,
    /// Default per-request deadline for `Http` effects.
    pub http_timeout: Duration,
    /// Watchdog polling cadence and ceiling.
    pub probe: ProbeConfig,
    /// WebSocket reconnection backoff tuning.
    pub reconnect: ReconnectConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://192.168.1.1"
                .parse()
                .expect("static URL is valid"),
            ws_url: "wss://192.168.1.1/pubsub"
                .parse()
                .expect("static URL is valid"),
            tls: TlsVerification::default(),
            http_timeout: Duration::from_secs(30),
            probe: ProbeConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}
