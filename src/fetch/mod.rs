//! Fetch adapter — one HTTP call in, one typed outcome out.
//!
//! [`FetchAdapter`] attaches the standard headers, sends the request
//! through a [`Transport`], and folds every way the call can go wrong into
//! [`FetchError`]:
//!
//! | Outcome                                   | Result                       |
//! |-------------------------------------------|------------------------------|
//! | transport failure                         | [`FetchError::Network`]      |
//! | `429 Too Many Requests`                   | [`FetchError::RateLimited`]  |
//! | any other non-2xx                         | [`FetchError::Http`]         |
//! | 2xx with `"success": false`               | [`FetchError::Business`]     |
//! | 2xx with a body that is not the envelope  | [`FetchError::Decode`]       |
//!
//! The service wraps every payload in an envelope:
//!
//! ```json
//! { "success": true, "data": { ... }, "message": "...", "error": "..." }
//! ```

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::auth::{FileTokenStore, NoToken, TokenStore};
use crate::config::{BaseUrl, ClientConfig, ConfigError};
use crate::http::{Method, Request, Response, StatusCode};
use crate::transport::{TcpTransport, Transport, TransportError};

/// `Retry-After` value reported when a 429 carries no header.
pub const DEFAULT_RETRY_AFTER: &str = "60";

/// Uniform error for every call made through [`FetchAdapter`].
///
/// `Clone` so one failed fetch can be handed to every caller sharing it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("rate limited, retry after {retry_after} seconds")]
    RateLimited { retry_after: String },

    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("{message}")]
    Business { message: String },

    #[error("failed to decode response: {message}")]
    Decode { message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidRequest(e) => Self::InvalidRequest(e.to_string()),
            other => Self::Network {
                message: other.to_string(),
            },
        }
    }
}

impl FetchError {
    /// The `Retry-After` value for rate-limited calls.
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::RateLimited { retry_after } => Some(retry_after),
            _ => None,
        }
    }

    /// The HTTP status, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Response envelope with the payload left undecoded.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl Envelope {
    fn explanation(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .filter(|m| !m.trim().is_empty())
    }
}

/// Sends requests to the dashboard backend and decodes its envelopes.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct FetchAdapter {
    transport: Arc<dyn Transport>,
    base: BaseUrl,
    tokens: Arc<dyn TokenStore>,
}

impl FetchAdapter {
    pub fn new(transport: Arc<dyn Transport>, base: BaseUrl, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            transport,
            base,
            tokens,
        }
    }

    /// Builds a TCP-backed adapter. The token comes from
    /// `config.token_file` when set.
    ///
    /// # Errors
    ///
    /// Returns the validation error for an unusable configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let transport = TcpTransport::from_config(config)?;
        let base = transport.base().clone();
        let tokens: Arc<dyn TokenStore> = match &config.token_file {
            Some(path) => Arc::new(FileTokenStore::new(path)),
            None => Arc::new(NoToken),
        };
        Ok(Self::new(Arc::new(transport), base, tokens))
    }

    pub fn base(&self) -> &BaseUrl {
        &self.base
    }

    /// `GET` a path and return the envelope's `data`, which must be present.
    pub async fn get_json<T: DeserializeOwned>(&self, target: &str) -> Result<T, FetchError> {
        let request = Request::new(Method::Get, self.base.join(target));
        self.send(request)
            .await?
            .ok_or_else(|| FetchError::Decode {
                message: "response envelope has no data".to_owned(),
            })
    }

    /// `DELETE` a path; the envelope's `data` is optional.
    pub async fn delete_json<T: DeserializeOwned>(
        &self,
        target: &str,
    ) -> Result<Option<T>, FetchError> {
        self.send(Request::new(Method::Delete, self.base.join(target)))
            .await
    }

    /// `DELETE` with a JSON body; the envelope's `data` is optional.
    pub async fn delete_json_with_body<B, T>(
        &self,
        target: &str,
        body: &B,
    ) -> Result<Option<T>, FetchError>
    where
        B: serde::Serialize,
        T: DeserializeOwned,
    {
        let request = Request::new(Method::Delete, self.base.join(target))
            .json(body)
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        self.send(request).await
    }

    /// Sends `request` with the standard headers and interprets the reply.
    pub async fn send<T: DeserializeOwned>(&self, request: Request) -> Result<Option<T>, FetchError> {
        let token = self.tokens.token();
        let request = request
            .header("Accept", "application/json")
            .bearer(token.as_deref());
        request
            .validate()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let method = request.method();
        let target = request.target().to_owned();
        let response = self.transport.send(request).await?;
        debug!(
            method = %method,
            target = %target,
            status = %response.status(),
            "fetch completed"
        );
        interpret(&response)
    }
}

/// Maps a raw response onto the envelope contract.
fn interpret<T: DeserializeOwned>(response: &Response) -> Result<Option<T>, FetchError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_RETRY_AFTER)
            .to_owned();
        return Err(FetchError::RateLimited { retry_after });
    }

    if !status.is_success() {
        let reason = response
            .json::<Envelope>()
            .ok()
            .and_then(|env| env.explanation().map(str::to_owned))
            .unwrap_or_else(|| fallback_reason(response));
        return Err(FetchError::Http {
            status: status.as_u16(),
            reason,
        });
    }

    let envelope: Envelope = response.json().map_err(|e| FetchError::Decode {
        message: e.to_string(),
    })?;

    if !envelope.success {
        let message = envelope.explanation().unwrap_or("request failed").to_owned();
        return Err(FetchError::Business { message });
    }

    match envelope.data {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(data) => serde_json::from_value(data)
            .map(Some)
            .map_err(|e| FetchError::Decode {
                message: e.to_string(),
            }),
    }
}

fn fallback_reason(response: &Response) -> String {
    let sent = response.reason().trim();
    if sent.is_empty() {
        response.status().canonical_reason().to_owned()
    } else {
        sent.to_owned()
    }
}
