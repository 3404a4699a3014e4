// Bearer-token authentication against the console's token endpoints.
//
// The console issues opaque bearer tokens: `POST /token/login` exchanges
// credentials for one, `GET /token/refresh` extends it, and
// `POST /token/validate` checks it. The current token lives behind an
// RwLock so the HTTP effects and the WebSocket handshake share one
// session without coordinating.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Shared handle to the console's token session.
///
/// Cheaply cloneable; all clones observe the same current token.
#[derive(Clone)]
pub struct AuthClient {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    http: reqwest::Client,
    base_url: Url,
    bearer: RwLock<Option<SecretString>>,
}

impl AuthClient {
    /// Create an auth client with no token. Call [`login`](Self::login)
    /// or [`set_bearer`](Self::set_bearer) before connecting anything.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self {
            inner: Arc::new(AuthInner {
                http,
                base_url,
                bearer: RwLock::new(None),
            }),
        })
    }

    /// The current bearer token, if any.
    pub async fn bearer(&self) -> Option<String> {
        self.inner
            .bearer
            .read()
            .await
            .as_ref()
            .map(|t| t.expose_secret().to_owned())
    }

    /// Install a token obtained out of band (restored session, tests).
    pub async fn set_bearer(&self, token: impl Into<String>) {
        *self.inner.bearer.write().await = Some(SecretString::from(token.into()));
    }

    /// Drop the current token (logout).
    pub async fn clear(&self) {
        *self.inner.bearer.write().await = None;
    }

    // ── Token endpoints ──────────────────────────────────────────────

    /// Exchange credentials for a bearer token.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<(), Error> {
        let url = self.inner.base_url.join("token/login")?;
        debug!(%url, username, "token login");

        let response = self
            .inner
            .http
            .post(url)
            .json(&serde_json::json!({
                "username": username,
                "password": password.expose_secret(),
            }))
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = response.status();
        let text = response.text().await.map_err(Error::Transport)?;

        if !status.is_success() {
            return Err(Error::Authentication {
                message: format!("login rejected with {status}"),
            });
        }

        *self.inner.bearer.write().await = Some(SecretString::from(text));
        Ok(())
    }

    /// Refresh the current token. On success the stored token is replaced;
    /// non-2xx means the session is gone and the caller must re-login.
    pub async fn refresh(&self) -> Result<(), Error> {
        let url = self.inner.base_url.join("token/refresh")?;
        debug!(%url, "token refresh");

        let mut request = self.inner.http.get(url);
        if let Some(token) = self.bearer().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(Error::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(Error::Transport)?;

        if !status.is_success() {
            return Err(Error::TokenExpired);
        }

        *self.inner.bearer.write().await = Some(SecretString::from(text));
        Ok(())
    }

    /// Check whether the current token is still accepted.
    pub async fn validate(&self) -> Result<bool, Error> {
        let url = self.inner.base_url.join("token/validate")?;

        let mut request = self.inner.http.post(url);
        if let Some(token) = self.bearer().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(Error::Transport)?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => Ok(true),
            401 | 403 => Ok(false),
            s => Err(Error::Api {
                status: s,
                message: format!("token validation returned {status}"),
            }),
        }
    }
}
