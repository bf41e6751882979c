//! Ephemeral session tokens.
//!
//! When the relay sits behind an authenticated gateway, each connection
//! first asks a token endpoint for a short-lived secret and presents it as
//! `Authorization: Bearer <secret>` on the WebSocket handshake.  The
//! endpoint answers with the realtime-session shape:
//!
//! ```json
//! { "client_secret": { "value": "ek_…", "expires_at": 1730000000 } }
//! ```

use async_trait::async_trait;

use crate::config::TransportConfig;

use super::TransportError;

// ---------------------------------------------------------------------------
// TokenSource trait
// ---------------------------------------------------------------------------

/// Supplies a bearer token for one connection attempt.
///
/// Called once per open, so a reconnect always presents a fresh token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<String, TransportError>;
}

// ---------------------------------------------------------------------------
// HttpTokenSource
// ---------------------------------------------------------------------------

/// POSTs to `TransportConfig::token_url` and extracts `client_secret.value`.
pub struct HttpTokenSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTokenSource {
    /// `None` when no `token_url` is configured.
    ///
    /// The client carries the connect timeout as its per-request timeout.
    pub fn from_config(config: &TransportConfig) -> Option<Self> {
        let url = config.token_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }

        let client = reqwest::Client::builder()
            .timeout(config.connect_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Some(Self {
            client,
            url: url.to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    /// The `Authorization` header is attached only for a non-empty
    /// `api_key`.
    async fn fetch(&self) -> Result<String, TransportError> {
        let mut req = self.client.post(&self.url);

        let key = self.api_key.as_deref().unwrap_or("");
        if !key.is_empty() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?.error_for_status()?;
        let json: serde_json::Value = response.json().await?;

        client_secret(&json)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Token("response has no client_secret.value".into()))
    }
}

/// Pull `client_secret.value` out of a token response.
pub fn client_secret(json: &serde_json::Value) -> Option<&str> {
    json["client_secret"]["value"]
        .as_str()
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
