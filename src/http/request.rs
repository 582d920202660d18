//! Outgoing HTTP/1.1 request builder.
//!
//! Provides a fluent builder API for constructing requests and serializing
//! them to a byte buffer for transmission over TCP.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method};

/// A request that cannot be written to the wire as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request target contains a control character")]
    InvalidTarget,

    #[error("invalid header name `{name}`")]
    InvalidHeaderName { name: String },

    #[error("header `{name}` has a value containing CR, LF or NUL")]
    InvalidHeaderValue { name: String },
}

/// An HTTP/1.1 request, ready to be serialized and sent.
///
/// The target is an origin-form request target (`/path?query`); the host is
/// supplied at serialization time by the transport.
///
/// # Examples
///
/// ```
/// use testhist::http::{Method, Request};
///
/// let request = Request::new(Method::Get, "/api/test/history?page=1")
///     .header("Accept", "application/json");
///
/// let bytes = request.into_bytes("localhost:3001").unwrap();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("GET /api/test/history?page=1 HTTP/1.1\r\n"));
/// assert!(text.contains("Host: localhost:3001\r\n"));
/// assert!(text.contains("Connection: close\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Creates a request with an empty body.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Sets a request header, replacing earlier values for the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Sets `Authorization: Bearer <token>` when a token is present.
    #[must_use]
    pub fn bearer(mut self, token: Option<&str>) -> Self {
        if let Some(token) = token {
            self.headers.set_bearer(token);
        }
        self
    }

    /// Sets the request body from raw bytes.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and `Content-Type: application/json`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be encoded.
    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .header("Content-Type", "application/json")
            .body_bytes(body))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Returns the request target (path plus optional query).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Checks that the target and every header can be serialized without
    /// breaking the request framing.
    ///
    /// # Errors
    ///
    /// Returns the first offending target or header.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.target.bytes().any(|b| b.is_ascii_control() || b == b' ') {
            return Err(RequestError::InvalidTarget);
        }
        for (name, value) in self.headers.iter() {
            if name.is_empty() || !name.bytes().all(is_token_byte) {
                return Err(RequestError::InvalidHeaderName {
                    name: name.to_owned(),
                });
            }
            if value.bytes().any(|b| matches!(b, b'\r' | b'\n' | b'\0')) {
                return Err(RequestError::InvalidHeaderValue {
                    name: name.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Serializes the request into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Host: <host>` unless one was set explicitly.
    /// - `Content-Length: <n>` when the body is non-empty or the method
    ///   carries a body.
    /// - `Connection: close`. The transport opens one connection per request.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] instead of writing a target or header
    /// that would smuggle extra lines onto the wire.
    pub fn into_bytes(mut self, host: &str) -> Result<BytesMut, RequestError> {
        if !self.headers.contains("host") {
            self.headers.set("Host", host);
        }
        self.headers.set("Connection", "close");
        self.validate()?;

        let content_length = self.body.len();
        let estimated_size = 64 + self.target.len() + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Request line
        buf.put(format!("{} {} HTTP/1.1\r\n", self.method, self.target).as_bytes());

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if content_length > 0 || matches!(self.method, Method::Post | Method::Put | Method::Patch)
        {
            buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        }

        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body);
        }

        Ok(buf)
    }
}

/// `tchar` from RFC 9110 §5.6.2.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
