//! HTTP/1.1 request parsing using the [`httparse`] crate.
//!
//! [`RequestDecoder`] reads one request at a time out of a connection buffer.
//! It parses the head once, then takes body bytes out of the buffer as they
//! arrive. [`Request::parse`] is the same machinery as a pure function over a
//! byte slice. Both either yield a complete request, report which part is
//! still missing, or fail with a [`ParseError`] naming the violated
//! expectation.

use std::str::{self, Utf8Error};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::chunked::{ChunkedDecoder, ChunkedError};
use super::percent::{DecodeError, percent_decode};
use super::{Headers, Method, QueryParams, StatusCode, UnknownMethod};

/// Maximum number of headers we support per request.
const MAX_HEADERS: usize = 64;

/// Errors that can occur while parsing an HTTP/1.1 request.
///
/// Every variant means the request cannot be served; the connection answers
/// with [`ParseError::status`] and closes.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,

    #[error(transparent)]
    UnsupportedMethod(#[from] UnknownMethod),

    #[error("unsupported HTTP version (expected HTTP/1.0 or HTTP/1.1)")]
    UnsupportedVersion,

    #[error("request target must be an absolute path")]
    UnsupportedTarget,

    #[error("invalid request target: {0}")]
    InvalidTarget(#[from] DecodeError),

    #[error("malformed header line")]
    BadHeader,

    #[error("value of header `{name}` is not valid UTF-8")]
    NonUtf8Header { name: String },

    #[error("more than {MAX_HEADERS} header fields")]
    TooManyHeaders,

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("both Content-Length and Transfer-Encoding are present")]
    ConflictingFraming,

    #[error("unsupported transfer encoding `{0}`")]
    UnsupportedTransferEncoding(String),

    #[error("malformed chunked body: {0}")]
    Chunked(ChunkedError),

    #[error("connection closed after {received} of {expected} body bytes")]
    BodyTooShort { expected: usize, received: usize },

    #[error("connection closed before the chunked body ended")]
    UnterminatedChunkedBody,

    #[error("connection closed before the request head was complete")]
    TruncatedHead,

    #[error("request head exceeds the limit of {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("request body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl ParseError {
    /// The response status this failure is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HeadTooLarge { .. } | Self::TooManyHeaders => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<httparse::Error> for ParseError {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::Version => Self::UnsupportedVersion,
            httparse::Error::HeaderName | httparse::Error::HeaderValue => Self::BadHeader,
            httparse::Error::TooManyHeaders => Self::TooManyHeaders,
            _ => Self::BadRequestLine,
        }
    }
}

impl From<ChunkedError> for ParseError {
    fn from(err: ChunkedError) -> Self {
        match err {
            ChunkedError::TooLarge { limit } | ChunkedError::FramingTooLarge { limit } => {
                Self::BodyTooLarge { limit }
            }
            ChunkedError::TrailersTooLarge { limit } => Self::HeadTooLarge { limit },
            other => Self::Chunked(other),
        }
    }
}

/// Size limits applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Longest accepted request line plus header block, in bytes.
    pub max_head_size: usize,
    /// Largest accepted decoded body, in bytes.
    ///
    /// Chunk-size lines and trailers of a chunked body are budgeted
    /// separately, each against `max_head_size`.
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_size: 64 * 1024,
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

/// Outcome of feeding a connection's bytes to a [`RequestDecoder`].
#[derive(Debug)]
pub enum Parsed {
    /// A full request, and how many bytes of the stream it occupied.
    Complete(Request, usize),

    /// The request line and headers are not terminated yet.
    NeedHead,

    /// The head is complete but the body is still arriving.
    NeedBody {
        /// The client sent `Expect: 100-continue` and waits for an interim response.
        expect_continue: bool,
        /// Declared `Content-Length`, or `None` for a chunked body.
        expected: Option<usize>,
        /// Body bytes received so far, framing included.
        received: usize,
    },
}

impl Parsed {
    /// The error to report if the peer closes the connection in this state.
    ///
    /// Returns `None` for [`Parsed::Complete`].
    pub fn eof_error(&self) -> Option<ParseError> {
        match *self {
            Parsed::Complete(..) => None,
            Parsed::NeedHead => Some(ParseError::TruncatedHead),
            Parsed::NeedBody {
                expected: Some(expected),
                received,
                ..
            } => Some(ParseError::BodyTooShort { expected, received }),
            Parsed::NeedBody { expected: None, .. } => Some(ParseError::UnterminatedChunkedBody),
        }
    }
}

// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Length(usize),
    Chunked,
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. Header names are
/// stored lower-cased; the path and query parameters are percent-decoded.
///
/// # Examples
///
/// ```
/// use erica::http::{Method, Parsed, Request};
/// use erica::http::request::Limits;
///
/// let raw = b"GET /hello%20there?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let Parsed::Complete(request, consumed) = Request::parse(raw, &Limits::default()).unwrap() else {
///     panic!("request should be complete");
/// };
///
/// assert_eq!(consumed, raw.len());
/// assert_eq!(request.method(), Method::Get);
/// assert_eq!(request.path(), "/hello there");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query_string: Option<String>,
    query: QueryParams,
    body: Bytes,
}

impl Request {
    /// Parses a request from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] as soon as the buffered bytes cannot be the
    /// beginning of a valid request, or exceed `limits`.
    pub fn parse(buf: &[u8], limits: &Limits) -> Result<Parsed, ParseError> {
        let mut scratch = BytesMut::from(buf);
        RequestDecoder::new(*limits).decode(&mut scratch)
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Returns the percent-decoded request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Returns the decoded query parameters.
    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    /// Returns the first decoded value of query parameter `key`.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`Utf8Error`] if the body is not valid UTF-8.
    pub fn text(&self) -> Result<&str, Utf8Error> {
        str::from_utf8(&self.body)
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the body is not valid JSON for `T`.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }

    /// Returns `true` if the client asked for the connection to stay open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent.
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is sent.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            false
        } else if self.version == 0 {
            self.headers.has_token("connection", "keep-alive")
        } else {
            true
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

/// Reads requests out of a connection buffer across many reads.
///
/// The decoder remembers a parsed head and the body position between calls,
/// and removes the bytes of a request from the buffer as it consumes them.
/// Whatever follows a complete request stays in the buffer.
#[derive(Debug)]
pub struct RequestDecoder {
    limits: Limits,
    pending: Option<Pending>,
}

// A request whose head has been parsed but whose body is still arriving.
#[derive(Debug)]
struct Pending {
    request: Request,
    head_len: usize,
    expect_continue: bool,
    body: BodyDecoder,
}

#[derive(Debug)]
enum BodyDecoder {
    Empty,
    Length(usize),
    Chunked(ChunkedDecoder),
}

impl BodyDecoder {
    fn wire_len(&self) -> usize {
        match self {
            BodyDecoder::Empty => 0,
            BodyDecoder::Length(len) => *len,
            BodyDecoder::Chunked(decoder) => decoder.consumed(),
        }
    }
}

impl RequestDecoder {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            pending: None,
        }
    }

    /// Returns `true` between requests, when no head has been parsed yet.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Consumes the next request from the front of `buf`, or as much of it
    /// as has arrived.
    ///
    /// A partial head is left in `buf` and parsed again on the next call.
    /// Once the head is complete its bytes, and any body bytes, are removed.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] as soon as the bytes cannot be the beginning
    /// of a valid request, or exceed the limits. The decoder must not be used
    /// after an error.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Parsed, ParseError> {
        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => match parse_head(buf, &self.limits)? {
                Some(pending) => {
                    buf.advance(pending.head_len);
                    pending
                }
                None => return Ok(Parsed::NeedHead),
            },
        };

        let body = match &mut pending.body {
            BodyDecoder::Empty => Some(Bytes::new()),
            BodyDecoder::Length(len) => {
                let len = *len;
                (buf.len() >= len).then(|| buf.split_to(len).freeze())
            }
            BodyDecoder::Chunked(decoder) => decoder.decode(buf)?,
        };

        let Some(body) = body else {
            let (expected, received) = match &pending.body {
                BodyDecoder::Length(len) => (Some(*len), buf.len()),
                BodyDecoder::Chunked(decoder) => (None, decoder.consumed() + buf.len()),
                BodyDecoder::Empty => (Some(0), 0),
            };
            let state = Parsed::NeedBody {
                expect_continue: pending.expect_continue,
                expected,
                received,
            };
            self.pending = Some(pending);
            return Ok(state);
        };

        let consumed = pending.head_len + pending.body.wire_len();
        let mut request = pending.request;
        request.body = body;
        Ok(Parsed::Complete(request, consumed))
    }
}

// Parses the request line and headers at the start of `buf`, if complete.
fn parse_head(buf: &[u8], limits: &Limits) -> Result<Option<Pending>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw_req = httparse::Request::new(&mut headers);

    let head_len = match raw_req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial if buf.len() > limits.max_head_size => {
            return Err(ParseError::HeadTooLarge {
                limit: limits.max_head_size,
            });
        }
        httparse::Status::Partial => return Ok(None),
    };
    if head_len > limits.max_head_size {
        return Err(ParseError::HeadTooLarge {
            limit: limits.max_head_size,
        });
    }

    let method: Method = raw_req.method.ok_or(ParseError::BadRequestLine)?.parse()?;
    let version = raw_req.version.ok_or(ParseError::UnsupportedVersion)?;
    let target = raw_req.path.ok_or(ParseError::BadRequestLine)?;
    if !(target.starts_with('/') || (target == "*" && method == Method::Options)) {
        return Err(ParseError::UnsupportedTarget);
    }

    let (raw_path, query_string) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let path = percent_decode(raw_path)?.into_owned();
    let query = query_string
        .map(QueryParams::parse)
        .transpose()?
        .unwrap_or_default();

    let mut header_map = Headers::with_capacity(raw_req.headers.len());
    for header in raw_req.headers.iter() {
        let value = str::from_utf8(header.value).map_err(|_| ParseError::NonUtf8Header {
            name: header.name.to_owned(),
        })?;
        header_map.insert(header.name.to_ascii_lowercase(), value);
    }

    let expect_continue = version == 1
        && header_map
            .get("expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"));

    let body = match body_kind(&header_map)? {
        BodyKind::Empty => BodyDecoder::Empty,
        BodyKind::Length(len) if len > limits.max_body_size => {
            return Err(ParseError::BodyTooLarge {
                limit: limits.max_body_size,
            });
        }
        BodyKind::Length(len) => BodyDecoder::Length(len),
        BodyKind::Chunked => BodyDecoder::Chunked(ChunkedDecoder::new(
            limits.max_body_size,
            limits.max_head_size,
        )),
    };

    let request = Request {
        method,
        path,
        version,
        headers: header_map,
        query_string: query_string.map(str::to_owned),
        query,
        body: Bytes::new(),
    };
    Ok(Some(Pending {
        request,
        head_len,
        expect_continue,
        body,
    }))
}

// Determines body framing from the (lower-cased) request headers.
fn body_kind(headers: &Headers) -> Result<BodyKind, ParseError> {
    let has_te = headers.contains("transfer-encoding");
    let has_cl = headers.contains("content-length");

    if has_te && has_cl {
        return Err(ParseError::ConflictingFraming);
    }

    if has_te {
        let codings: Vec<&str> = headers
            .get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        return match codings.as_slice() {
            [coding] if coding.eq_ignore_ascii_case("chunked") => Ok(BodyKind::Chunked),
            _ => Err(ParseError::UnsupportedTransferEncoding(codings.join(", "))),
        };
    }

    // Repeated or comma-joined Content-Length values must all agree.
    let mut length = None;
    for item in headers
        .get_all("content-length")
        .flat_map(|v| v.split(','))
        .map(str::trim)
    {
        if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let n: usize = item
            .parse()
            .map_err(|_| ParseError::InvalidContentLength)?;
        if length.is_some_and(|prev| prev != n) {
            return Err(ParseError::InvalidContentLength);
        }
        length = Some(n);
    }

    Ok(match length {
        None | Some(0) => BodyKind::Empty,
        Some(n) => BodyKind::Length(n),
    })
}
