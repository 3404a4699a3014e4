// Plain HTTP client for the device console backend.
//
// Two jobs: execute generic requests on behalf of the shell's Http effect
// (any method, any path, optional JSON body, per-call deadline), and the
// typed healthcheck call the watchdog polls. Everything returns through
// the crate [`Error`] -- callers never touch reqwest types directly.

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// HTTP client bound to a single console base URL.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: Url,
}

/// Outcome of a generic request. Non-2xx statuses are outcomes, not
/// errors -- the decision engine owns the interpretation of status codes.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpOutcome {
    pub status: u16,
    pub body: serde_json::Value,
}

impl HttpClient {
    /// Create a client from a `TransportConfig`.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self { http, base_url })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// The console base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path or absolute URL against the base URL.
    fn resolve(&self, target: &str) -> Result<Url, Error> {
        if target.starts_with("http://") || target.starts_with("https://") {
            Ok(Url::parse(target)?)
        } else {
            Ok(self.base_url.join(target)?)
        }
    }

    // ── Generic requests ─────────────────────────────────────────────

    /// Execute a request and return its status and body.
    ///
    /// `deadline` bounds this single call, overriding the client-wide
    /// timeout. The body is parsed as JSON when possible; otherwise the
    /// raw text is carried as a JSON string so nothing is dropped.
    pub async fn perform(
        &self,
        method: Method,
        target: &str,
        body: Option<&serde_json::Value>,
        bearer: Option<&str>,
        deadline: Duration,
    ) -> Result<HttpOutcome, Error> {
        let url = self.resolve(target)?;
        debug!(%method, %url, "HTTP request");

        let mut request = self.http.request(method, url).timeout(deadline);
        if let Some(json) = body {
            request = request.json(json);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| timeout_or(e, deadline))?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(Error::Transport)?;

        let body = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::Value::String(text));

        Ok(HttpOutcome { status, body })
    }

    // ── Healthcheck ──────────────────────────────────────────────────

    /// Probe `GET /healthcheck` with no-cache headers and a short deadline.
    ///
    /// Non-2xx is an [`Error::Api`]: the watchdog counts it as "down" and
    /// the engine may surface it as a version-mismatch notice.
    pub async fn healthcheck(&self, deadline: Duration) -> Result<HealthReport, Error> {
        let url = self.base_url.join("healthcheck")?;
        debug!(%url, "healthcheck probe");

        let response = self
            .http
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::PRAGMA, "no-cache")
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| timeout_or(e, deadline))?;

        let status = response.status();
        let text = response.text().await.map_err(Error::Transport)?;

        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: format!("healthcheck returned {status}"),
            });
        }

        serde_json::from_str(&text).map_err(|e| Error::Protocol {
            message: format!("malformed healthcheck body: {e}"),
            body: text,
        })
    }
}

/// Map a reqwest error to [`Error::Timeout`] when the deadline elapsed.
fn timeout_or(e: reqwest::Error, deadline: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            timeout_ms: deadline.as_millis() as u64,
        }
    } else {
        Error::Transport(e)
    }
}

// ── Healthcheck payload ──────────────────────────────────────────────

/// Parsed body of a successful healthcheck response.
///
/// `#[serde(flatten)]` captures any fields beyond the core set so nothing
/// the device reports is silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub version_info: VersionInfo,

    /// Present while a firmware update is being validated.
    #[serde(default)]
    pub update_validation_status: Option<UpdateValidation>,

    /// Set when the device rolled back a network reconfiguration.
    #[serde(default)]
    pub network_rollback_occurred: bool,

    /// All remaining fields the device sends.
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionInfo {
    pub current: String,
    pub required: String,
    #[serde(default)]
    pub mismatch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateValidation {
    pub status: UpdateValidationStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateValidationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Recovered,
    #[serde(other)]
    Unknown,
}

impl HealthReport {
    /// Whether the device has reached a terminal condition after a
    /// disruptive operation. A reachable device mid-validation is not
    /// recovered yet -- the watchdog keeps polling.
    pub fn is_settled(&self) -> bool {
        match &self.update_validation_status {
            None => true,
            Some(v) => matches!(
                v.status,
                UpdateValidationStatus::Succeeded | UpdateValidationStatus::Recovered
            ),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
