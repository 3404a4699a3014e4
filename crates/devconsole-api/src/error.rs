use thiserror::Error;

/// Top-level error type for the `devconsole-api` crate.
///
/// Covers every failure mode across the HTTP, token, and WebSocket
/// surfaces. `devconsole-core` maps these into user-facing diagnostics;
/// consumers of that crate never see these raw.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login rejected (wrong credentials, account locked, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Bearer token expired or revoked; a refresh is required.
    #[error("Bearer token expired -- re-authentication required")]
    TokenExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request exceeded its per-call deadline.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Console API ─────────────────────────────────────────────────
    /// Non-success status from a typed endpoint (healthcheck, token).
    #[error("Console API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket dropped while a request was in flight.
    #[error("WebSocket closed: {reason}")]
    WebSocketClosed { reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// Malformed payload from the server, with the raw body for debugging.
    #[error("Protocol violation: {message}")]
    Protocol { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates the bearer token is no
    /// longer valid and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(
            self,
            Self::TokenExpired | Self::Authentication { .. } | Self::Api { status: 401, .. }
        )
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } => true,
            _ => false,
        }
    }

    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
