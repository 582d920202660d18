//! Async HTTP/1.1 transport using Tokio.
//!
//! [`Transport`] is the seam between the fetch layer and the network.
//! [`TcpTransport`] opens one TCP connection per request, writes the
//! serialized [`Request`], and feeds each read to a [`ResponseDecoder`]
//! until it yields a complete response.

use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{BaseUrl, ClientConfig, ConfigError};
use crate::http::response::{ResponseDecoder, ResponseError};
use crate::http::{Request, RequestError, Response};

/// Errors produced while exchanging a request with the server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request cannot be sent: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("malformed response: {0}")]
    Parse(#[from] ResponseError),

    #[error("connection closed before the response was complete")]
    UnexpectedEof,

    #[error("response exceeds maximum allowed size of {max_bytes} bytes")]
    ResponseTooLarge { max_bytes: usize },
}

/// Sends a request and yields the server's response.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>>;
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Plain-TCP HTTP/1.1 client transport.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use testhist::config::BaseUrl;
/// use testhist::http::{Method, Request};
/// use testhist::transport::{TcpTransport, Transport};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let base = BaseUrl::parse("http://127.0.0.1:3001")?;
/// let transport = TcpTransport::new(base, Duration::from_secs(5), Duration::from_secs(15));
/// let response = transport.send(Request::new(Method::Get, "/api/test/history")).await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    base: BaseUrl,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_response_size: usize,
}

impl TcpTransport {
    /// Maximum size of a response we will buffer before giving up (8 MiB).
    pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 8 * 1024 * 1024;

    pub fn new(base: BaseUrl, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            base,
            connect_timeout,
            request_timeout,
            max_response_size: Self::DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    /// Builds a transport from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns the validation error for an unusable configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let base = config.validate()?;
        Ok(Self::new(base, config.connect_timeout(), config.request_timeout())
            .max_response_size(config.max_response_bytes))
    }

    #[must_use]
    pub fn max_response_size(mut self, max_bytes: usize) -> Self {
        self.max_response_size = max_bytes;
        self
    }

    pub fn base(&self) -> &BaseUrl {
        &self.base
    }

    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        let addr = self.base.authority();
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout {
                stage: "connect",
                after: self.connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;

        debug!(
            addr = %addr,
            method = %request.method(),
            target = %request.target(),
            "sending request"
        );

        tokio::time::timeout(
            self.request_timeout,
            round_trip(&mut stream, request, &addr, self.max_response_size),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            stage: "request",
            after: self.request_timeout,
        })?
    }
}

impl Transport for TcpTransport {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        self.exchange(request).boxed()
    }
}

/// Writes `request` and reads one response from `stream`.
async fn round_trip(
    stream: &mut TcpStream,
    request: Request,
    host: &str,
    max_response_size: usize,
) -> Result<Response, TransportError> {
    stream.write_all(&request.into_bytes(host)?).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut decoder = ResponseDecoder::new();
    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;
        let eof = bytes_read == 0;

        if buf.len() > max_response_size {
            return Err(TransportError::ResponseTooLarge {
                max_bytes: max_response_size,
            });
        }

        match decoder.decode(&buf, eof) {
            Ok(response) => {
                debug!(status = %response.status(), bytes = buf.len(), "response received");
                return Ok(response);
            }
            Err(ResponseError::Incomplete) if eof => return Err(TransportError::UnexpectedEof),
            Err(ResponseError::Incomplete) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory transport for higher-level tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use tokio::sync::Notify;

    use super::{Transport, TransportError};
    use crate::http::{Request, Response, StatusCode};

    pub(crate) enum Reply {
        Respond(Response),
        Fail,
    }

    /// Replays queued replies in order and records every request.
    ///
    /// When `gate` is set, each send waits for one `notify_one` before
    /// answering, so tests can hold a fetch in flight.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<Request>>,
        calls: AtomicUsize,
        gate: Option<Notify>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn gated() -> Self {
            Self {
                gate: Some(Notify::new()),
                ..Self::default()
            }
        }

        pub(crate) fn push_json(&self, status: u16, body: serde_json::Value) -> &Self {
            let response = Response::new(StatusCode::from_u16(status), body.to_string())
                .with_header("Content-Type", "application/json");
            self.push(Reply::Respond(response))
        }

        pub(crate) fn push(&self, reply: Reply) -> &Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.notify_one();
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.requests.lock().unwrap().push(request);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                match self.replies.lock().unwrap().pop_front() {
                    Some(Reply::Respond(response)) => Ok(response),
                    Some(Reply::Fail) | None => Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ))),
                }
            }
            .boxed()
        }
    }
}
