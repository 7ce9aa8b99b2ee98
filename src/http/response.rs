//! HTTP/1.1 response builder.
//!
//! Handlers receive a fresh [`Response`], mutate or rebuild it, and hand it
//! back. Serialization consumes the value, so nothing a handler holds can
//! change the response once writing has begun.

use std::io;
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::body::{Body, BodySender};
use super::chunked::{self, LAST_CHUNK};
use super::{Headers, StatusCode};

/// Writing a response to the connection failed. The connection is unusable
/// afterwards.
#[derive(Debug, Error)]
#[error("failed to write response: {0}")]
pub struct ResponseWriteError(#[from] io::Error);

/// Per-request facts that decide how a response body is framed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Framing {
    /// Send headers only (the request was `HEAD`).
    pub omit_body: bool,
    /// The peer speaks HTTP/1.0 and cannot decode chunked bodies.
    pub http10: bool,
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use erica::http::{Response, StatusCode};
///
/// let mut response = Response::default()
///     .header("X-Request-Id", "abc-123")
///     .text("created");
/// response.set_status(StatusCode::CREATED);
///
/// assert_eq!(response.status(), StatusCode::CREATED);
/// assert_eq!(response.headers().get("content-type"), Some("text/plain"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
            keep_alive: true,
        }
    }

    /// Replaces the status code.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Replaces the status code in place.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a header in-place, replacing any existing values of that name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically when the response is sent.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        let body: String = body.into();
        self.body = Body::from(body);
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets the body in place. A later call overwrites, never appends.
    pub fn set_body_bytes(&mut self, body: impl Into<Bytes>) {
        self.body = Body::Full(body.into());
    }

    /// Replaces the body with any [`Body`], including a stream.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Sets a plain-text body with `Content-Type: text/plain`, unless a
    /// content type was already chosen.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        let text: String = text.into();
        self.default_content_type("text/plain");
        self.body = Body::from(text);
        self
    }

    /// Serializes `value` as the body with `Content-Type: application/json`,
    /// unless a content type was already chosen.
    ///
    /// Objects and arrays are written with `": "` and `", "` separators, e.g.
    /// `{"message": "Hello, World!"}`.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `value` cannot be serialized.
    pub fn json<T>(mut self, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let bytes = to_json_bytes(value)?;
        self.default_content_type("application/json");
        self.body = Body::from(bytes);
        Ok(self)
    }

    /// Switches to a streaming body sent with chunked framing and returns the
    /// sender that produces it. The body ends when the sender is dropped.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use erica::http::Response;
    ///
    /// # async fn handler() {
    /// let (response, tx) = Response::default().streaming();
    /// tokio::spawn(async move {
    ///     for line in ["one\n", "two\n"] {
    ///         if tx.send(line).await.is_err() {
    ///             break;
    ///         }
    ///     }
    /// });
    /// # drop(response);
    /// # }
    /// ```
    #[must_use]
    pub fn streaming(mut self) -> (Self, BodySender) {
        let (tx, body) = Body::channel();
        self.body = body;
        (self, tx)
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set so far.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the current body.
    pub fn payload(&self) -> &Body {
        &self.body
    }

    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// `true` if the handler asked for the connection to be closed, either
    /// through [`Response::keep_alive`] or a `Connection: close` header.
    pub(crate) fn requests_close(&self) -> bool {
        !self.keep_alive || self.headers.has_token("connection", "close")
    }

    fn default_content_type(&mut self, content_type: &str) {
        if !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", content_type);
        }
    }

    /// Serializes the response onto `io` using HTTP/1.1 wire format.
    ///
    /// Adds, replacing anything the handler set for the framing fields:
    /// - `Content-Type: text/plain; charset=utf-8` if a body exists and no
    ///   `Content-Type` header was set.
    /// - `Date`, unless already present.
    /// - `Connection: keep-alive` or `Connection: close`.
    /// - `Content-Length` for buffered bodies, `Transfer-Encoding: chunked` for
    ///   streams (HTTP/1.0 peers get a close-delimited stream instead).
    pub(crate) async fn write_to<W>(
        mut self,
        io: &mut W,
        framing: Framing,
    ) -> Result<(), ResponseWriteError>
    where
        W: AsyncWrite + Unpin,
    {
        let body = std::mem::take(&mut self.body);
        let close_delimited = body.is_stream() && framing.http10;
        if close_delimited {
            self.keep_alive = false;
        }
        let send_body = !framing.omit_body && !self.status.forbids_body();

        let mut buf = self.encode_head(&body, close_delimited);
        match body {
            Body::Full(bytes) => {
                if send_body {
                    buf.put_slice(&bytes);
                }
                io.write_all(&buf).await?;
            }
            Body::Stream(mut rx) => {
                io.write_all(&buf).await?;
                if send_body {
                    while let Some(chunk) = rx.recv().await {
                        if close_delimited {
                            io.write_all(&chunk).await?;
                        } else {
                            buf.clear();
                            chunked::encode_chunk(&chunk, &mut buf);
                            io.write_all(&buf).await?;
                        }
                    }
                    if !close_delimited {
                        io.write_all(LAST_CHUNK).await?;
                    }
                }
            }
        }
        io.flush().await?;
        Ok(())
    }

    // Finalizes the header block and renders the status line and headers.
    fn encode_head(&mut self, body: &Body, close_delimited: bool) -> BytesMut {
        for name in ["content-length", "transfer-encoding", "connection"] {
            self.headers.remove(name);
        }

        let has_body = !self.status.forbids_body() && !body.is_empty();
        if has_body && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }
        if !self.headers.contains("date") {
            self.headers
                .insert("Date", httpdate::fmt_http_date(SystemTime::now()));
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        if !self.status.forbids_body() {
            match body.len() {
                Some(len) => self.headers.insert("Content-Length", len.to_string()),
                None if close_delimited => {}
                None => self.headers.insert("Transfer-Encoding", "chunked"),
            }
        }

        let estimated_size = 128 + self.headers.len() * 64 + body.len().unwrap_or(0);
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// Serializes `value` as JSON with a space after every `:` and `,`.
///
/// # Errors
///
/// Returns [`serde_json::Error`] if `value` cannot be serialized.
pub fn to_json_bytes<T>(value: &T) -> Result<Vec<u8>, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let mut out = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn render_with(response: Response, framing: Framing) -> String {
        let mut out = Vec::new();
        response.write_to(&mut out, framing).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    async fn render(response: Response) -> String {
        render_with(response, Framing::default()).await
    }

    fn header<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
        let (head, _) = raw.split_once("\r\n\r\n")?;
        head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(": ")?;
            k.eq_ignore_ascii_case(name).then_some(v)
        })
    }

    #[tokio::test]
    async fn simple_ok_response() {
        let s = render(Response::new(StatusCode::OK).body("Hello")).await;
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[tokio::test]
    async fn date_and_connection_always_present() {
        let s = render(Response::default()).await;
        let date = header(&s, "date").unwrap();
        assert!(date.ends_with(" GMT"));
        assert_eq!(header(&s, "connection"), Some("keep-alive"));
    }

    #[tokio::test]
    async fn custom_headers_keep_insertion_order() {
        let r = Response::default()
            .header("X-First", "1")
            .header("X-Second", "2")
            .body("ok");
        let s = render(r).await;
        let first = s.find("X-First: 1\r\n").unwrap();
        let second = s.find("X-Second: 2\r\n").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn no_content_has_no_length_or_type() {
        let s = render(Response::new(StatusCode::NO_CONTENT).body("ignored")).await;
        assert!(s.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!s.contains("Content-Type"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn empty_body_gets_zero_length() {
        let s = render(Response::new(StatusCode::NOT_FOUND)).await;
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(header(&s, "content-length"), Some("0"));
        assert!(header(&s, "content-type").is_none());
    }

    #[tokio::test]
    async fn connection_close() {
        let s = render(Response::default().keep_alive(false)).await;
        assert!(s.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn unknown_status_phrase() {
        let status = StatusCode::from_u16(599).unwrap();
        let s = render(Response::new(status)).await;
        assert!(s.starts_with("HTTP/1.1 599 Unknown Status\r\n"));
    }

    #[tokio::test]
    async fn framing_headers_from_handler_are_replaced() {
        let mut r = Response::default().body("abc");
        r.set_header("Content-Length", "999");
        r.set_header("Transfer-Encoding", "gzip");
        let s = render(r).await;
        assert_eq!(header(&s, "content-length"), Some("3"));
        assert!(header(&s, "transfer-encoding").is_none());
    }

    #[tokio::test]
    async fn body_is_overwritten_not_appended() {
        let mut r = Response::default();
        r.set_body_bytes("first");
        r.set_body_bytes("second");
        let s = render(r).await;
        assert!(s.ends_with("\r\n\r\nsecond"));
    }

    #[tokio::test]
    async fn json_helper_round_trips() {
        let value = json!({"message": "Hello, World!"});
        let s = render(Response::default().json(&value).unwrap()).await;

        assert_eq!(header(&s, "content-type"), Some("application/json"));
        let (_, body) = s.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, r#"{"message": "Hello, World!"}"#);
        let length: usize = header(&s, "content-length").unwrap().parse().unwrap();
        assert_eq!(length, body.len());

        let decoded: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_separators_nest() {
        let bytes = to_json_bytes(&json!({"a": [1, 2], "b": {"c": null}})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a": [1, 2], "b": {"c": null}}"#
        );
    }

    #[test]
    fn explicit_content_type_wins() {
        let r = Response::default()
            .header("Content-Type", "application/problem+json")
            .json(&json!({"title": "nope"}))
            .unwrap();
        assert_eq!(
            r.headers().get("content-type"),
            Some("application/problem+json")
        );
        assert_eq!(r.headers().get_all("content-type").count(), 1);
    }

    #[test]
    fn text_helper_sets_plain_text() {
        let r = Response::default().text("hi");
        assert_eq!(r.headers().get("content-type"), Some("text/plain"));
        assert_eq!(r.payload().len(), Some(2));
    }

    #[tokio::test]
    async fn head_keeps_length_but_omits_body() {
        let framing = Framing {
            omit_body: true,
            ..Framing::default()
        };
        let s = render_with(Response::default().body("hello"), framing).await;
        assert_eq!(header(&s, "content-length"), Some("5"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn streaming_body_is_chunked() {
        let (response, tx) = Response::default().streaming();
        tokio::spawn(async move {
            tx.send("hello ").await.unwrap();
            tx.send("").await.unwrap();
            tx.send("world").await.unwrap();
        });
        let s = render(response).await;

        assert_eq!(header(&s, "transfer-encoding"), Some("chunked"));
        assert!(header(&s, "content-length").is_none());
        assert!(s.ends_with("\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn streaming_to_http10_is_close_delimited() {
        let (response, tx) = Response::default().streaming();
        tokio::spawn(async move {
            tx.send("raw").await.unwrap();
        });
        let framing = Framing {
            http10: true,
            ..Framing::default()
        };
        let s = render_with(response, framing).await;

        assert!(header(&s, "transfer-encoding").is_none());
        assert_eq!(header(&s, "connection"), Some("close"));
        assert!(s.ends_with("\r\n\r\nraw"));
    }
}
