// devconsole-api: wire-level clients for the device console backend.
//
// Three surfaces: plain HTTP (generic requests + the healthcheck endpoint),
// token-based authentication, and the pub/sub WebSocket. devconsole-core
// builds the shell runtime on top of these.

pub mod auth;
pub mod error;
pub mod http;
pub mod transport;
pub mod websocket;

// ── Primary re-exports ──────────────────────────────────────────────
pub use auth::AuthClient;
pub use error::Error;
pub use http::{
    HealthReport, HttpClient, HttpOutcome, UpdateValidation, UpdateValidationStatus, VersionInfo,
};
pub use transport::{TlsMode, TransportConfig};

// Re-exported so callers name HTTP methods without depending on reqwest.
pub use reqwest::Method;
pub use websocket::{
    DisconnectReason, Publication, ReconnectConfig, SocketCommand, SocketHandle, SocketState,
};
