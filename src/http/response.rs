//! HTTP/1.1 response parsing using the [`httparse`] crate.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, StatusCode};

/// Errors that can occur while parsing an HTTP/1.1 response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value}")]
    InvalidContentLength { value: String },

    #[error("invalid chunked body encoding")]
    InvalidChunk,
}

/// A fully received HTTP/1.1 response.
///
/// Created by [`Response::parse`] from the bytes read off a connection.
/// Chunked bodies are decoded, so [`body`](Self::body) is always the
/// payload itself.
///
/// # Examples
///
/// ```
/// use testhist::http::{Response, StatusCode};
///
/// let raw = b"HTTP/1.1 429 Too Many Requests\r\nRetry-After: 30\r\nContent-Length: 0\r\n\r\n";
/// let response = Response::parse(raw, false).unwrap();
///
/// assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
/// assert_eq!(response.headers().get("retry-after"), Some("30"));
/// assert!(response.body().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    reason: String,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Maximum number of headers we support per response.
    const MAX_HEADERS: usize = 64;

    /// Builds a response directly. Used by in-memory transports.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: status.canonical_reason().to_owned(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Adds a header to a directly built response.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Parse a complete HTTP/1.1 response from a byte slice.
    ///
    /// `eof` tells the parser whether the peer has closed the connection;
    /// responses framed neither by `Content-Length` nor by chunked encoding
    /// run until EOF. Interim `1xx` responses are skipped.
    ///
    /// For a buffer that grows across reads use [`ResponseDecoder`], which
    /// does not re-scan bytes it has already consumed.
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`] — more data is needed.
    /// - [`ResponseError::Parse`] — the head is malformed.
    /// - [`ResponseError::InvalidContentLength`] / [`ResponseError::InvalidChunk`]
    ///   — the body framing is malformed.
    pub fn parse(buf: &[u8], eof: bool) -> Result<Self, ResponseError> {
        ResponseDecoder::new().decode(buf, eof)
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the reason phrase sent by the server.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the decoded body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }
}

/// Parsed status line and headers of the final (non-1xx) response.
#[derive(Debug)]
struct Head {
    status: StatusCode,
    reason: String,
    headers: Headers,
    framing: Framing,
}

/// How the body's end is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilEof,
}

/// Incremental response decoder for a buffer that only grows.
///
/// Each call to [`decode`](Self::decode) gets the whole buffer read so far.
/// The head is parsed once, and chunked data is copied out once, so total
/// work stays linear in the response size however the bytes arrive.
///
/// # Examples
///
/// ```
/// use testhist::http::response::{ResponseDecoder, ResponseError};
///
/// let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
/// let mut decoder = ResponseDecoder::new();
///
/// assert!(matches!(decoder.decode(&raw[..40], false), Err(ResponseError::Incomplete)));
/// let response = decoder.decode(raw, false).unwrap();
/// assert_eq!(&response.body()[..], b"hi");
/// ```
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    /// Start of the next response head to parse (moves past 1xx).
    head_start: usize,
    head: Option<Head>,
    body_start: usize,
    /// Start of the next chunk-size line.
    chunk_cursor: usize,
    chunked_body: BytesMut,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the buffer read so far. `buf` must extend the slice given to
    /// the previous call.
    ///
    /// # Errors
    ///
    /// The same as [`Response::parse`]. After a complete response the
    /// decoder is reset.
    pub fn decode(&mut self, buf: &[u8], eof: bool) -> Result<Response, ResponseError> {
        if self.head.is_none() {
            self.parse_head(buf)?;
        }
        let framing = match &self.head {
            Some(head) => head.framing,
            None => return Err(ResponseError::Incomplete),
        };

        let body_bytes = &buf[self.body_start..];
        let body = match framing {
            Framing::Empty => Bytes::new(),
            Framing::Length(len) => {
                if body_bytes.len() < len {
                    return Err(ResponseError::Incomplete);
                }
                Bytes::copy_from_slice(&body_bytes[..len])
            }
            Framing::Chunked => self.decode_chunks(buf)?,
            Framing::UntilEof if eof => Bytes::copy_from_slice(body_bytes),
            Framing::UntilEof => return Err(ResponseError::Incomplete),
        };

        let head = std::mem::take(self)
            .head
            .ok_or(ResponseError::Incomplete)?;
        Ok(Response {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body,
        })
    }

    fn parse_head(&mut self, buf: &[u8]) -> Result<(), ResponseError> {
        loop {
            let rest = &buf[self.head_start..];
            let mut headers = [httparse::EMPTY_HEADER; Response::MAX_HEADERS];
            let mut raw = httparse::Response::new(&mut headers);

            let body_offset = match raw.parse(rest)? {
                httparse::Status::Complete(offset) => offset,
                httparse::Status::Partial => return Err(ResponseError::Incomplete),
            };

            let status = StatusCode::from_u16(
                raw.code.ok_or(ResponseError::MissingField { field: "status" })?,
            );
            if status.is_informational() {
                self.head_start += body_offset;
                continue;
            }

            let reason = raw.reason.unwrap_or_else(|| status.canonical_reason()).to_owned();
            let mut header_map = Headers::with_capacity(raw.headers.len());
            for header in raw.headers.iter() {
                if let Ok(value) = std::str::from_utf8(header.value) {
                    header_map.append(header.name, value);
                }
            }

            let framing = framing(status, &header_map)?;
            self.body_start = self.head_start + body_offset;
            self.chunk_cursor = self.body_start;
            self.head = Some(Head {
                status,
                reason,
                headers: header_map,
                framing,
            });
            return Ok(());
        }
    }

    /// Copies every complete chunk past the cursor. Trailers are skipped.
    fn decode_chunks(&mut self, buf: &[u8]) -> Result<Bytes, ResponseError> {
        loop {
            let rest = &buf[self.chunk_cursor..];
            let (data_start, size) = match httparse::parse_chunk_size(rest) {
                Ok(httparse::Status::Complete(pair)) => pair,
                Ok(httparse::Status::Partial) => return Err(ResponseError::Incomplete),
                Err(_) => return Err(ResponseError::InvalidChunk),
            };
            let size = usize::try_from(size).map_err(|_| ResponseError::InvalidChunk)?;
            let data = &rest[data_start..];

            if size == 0 {
                let terminated = data.starts_with(b"\r\n")
                    || data.windows(4).any(|w| w == b"\r\n\r\n");
                if !terminated {
                    return Err(ResponseError::Incomplete);
                }
                return Ok(std::mem::take(&mut self.chunked_body).freeze());
            }

            let end = size.checked_add(2).ok_or(ResponseError::InvalidChunk)?;
            if data.len() < end {
                return Err(ResponseError::Incomplete);
            }
            if &data[size..end] != b"\r\n" {
                return Err(ResponseError::InvalidChunk);
            }
            self.chunked_body.extend_from_slice(&data[..size]);
            self.chunk_cursor += data_start + end;
        }
    }
}

fn framing(status: StatusCode, headers: &Headers) -> Result<Framing, ResponseError> {
    if status == StatusCode::NO_CONTENT || status.as_u16() == 304 {
        return Ok(Framing::Empty);
    }

    if headers.has_token("transfer-encoding", "chunked") {
        return Ok(Framing::Chunked);
    }

    if let Some(value) = headers.get("content-length") {
        let len: usize = value
            .trim()
            .parse()
            .map_err(|_| ResponseError::InvalidContentLength {
                value: value.to_owned(),
            })?;
        return Ok(Framing::Length(len));
    }

    Ok(Framing::UntilEof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 16\r\n\r\n{\"success\":true}";
        let r = Response::parse(raw, false).unwrap();
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(r.reason(), "OK");
        assert_eq!(&r.body()[..], b"{\"success\":true}");
        let v: serde_json::Value = r.json().unwrap();
        assert_eq!(v["success"], true);
    }

    #[test]
    fn short_body_is_incomplete() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn partial_head_is_incomplete() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn chunked_body_is_decoded() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let r = Response::parse(raw, false).unwrap();
        assert_eq!(&r.body()[..], b"hello world");
    }

    #[test]
    fn chunked_without_terminator_is_incomplete() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn chunked_with_trailers() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let r = Response::parse(raw, false).unwrap();
        assert_eq!(&r.body()[..], b"ok");
    }

    #[test]
    fn unframed_body_needs_eof() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\npartial";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
        let r = Response::parse(raw, true).unwrap();
        assert_eq!(&r.body()[..], b"partial");
    }

    #[test]
    fn interim_continue_is_skipped() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let r = Response::parse(raw, false).unwrap();
        assert_eq!(r.status(), StatusCode::NO_CONTENT);
        assert!(r.body().is_empty());
    }

    #[test]
    fn bad_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: lots\r\n\r\n";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::InvalidContentLength { .. })
        ));
    }

    #[test]
    fn chunks_are_decoded_as_they_arrive() {
        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let mut expected = Vec::new();
        for i in 0..200u8 {
            let data = vec![b'a' + i % 26; 37];
            raw.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            raw.extend_from_slice(&data);
            raw.extend_from_slice(b"\r\n");
            expected.extend_from_slice(&data);
        }
        raw.extend_from_slice(b"0\r\n\r\n");

        let mut decoder = ResponseDecoder::new();
        let mut fed = 0;
        let response = loop {
            fed = (fed + 13).min(raw.len());
            match decoder.decode(&raw[..fed], false) {
                Ok(response) => break response,
                Err(ResponseError::Incomplete) => {
                    // Everything before the cursor has been copied out already.
                    assert!(decoder.chunk_cursor <= fed);
                    assert!(decoder.chunked_body.len() <= expected.len());
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        };

        assert_eq!(fed, raw.len());
        assert_eq!(&response.body()[..], &expected[..]);
    }

    #[test]
    fn decoder_waits_for_full_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut decoder = ResponseDecoder::new();
        assert!(matches!(
            decoder.decode(&raw[..raw.len() - 2], false),
            Err(ResponseError::Incomplete)
        ));
        assert!(decoder.head.is_some());
        let response = decoder.decode(raw, false).unwrap();
        assert_eq!(&response.body()[..], b"hello");
    }

    #[test]
    fn decoder_skips_interim_response_across_reads() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut decoder = ResponseDecoder::new();
        assert!(decoder.decode(&raw[..30], false).is_err());
        let response = decoder.decode(raw, false).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&response.body()[..], b"ok");
    }
}
