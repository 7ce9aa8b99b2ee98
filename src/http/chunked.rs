//! `Transfer-Encoding: chunked` framing (RFC 9112 §7.1).
//!
//! [`ChunkedDecoder`] consumes the body from a connection buffer as bytes
//! arrive and keeps its position between calls, so every byte is examined
//! once. Chunk extensions are ignored and trailer fields are read and
//! discarded.

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Longest chunk-size or trailer line accepted before its CRLF.
const MAX_LINE: usize = 4096;

/// The terminating zero-length chunk with an empty trailer section.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Errors raised while decoding a chunked body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkedError {
    #[error("malformed chunk-size line")]
    InvalidSize,

    #[error("chunk data is not followed by CRLF")]
    MissingTerminator,

    #[error("chunk-size or trailer line longer than {MAX_LINE} bytes")]
    LineTooLong,

    #[error("chunked body exceeds the limit of {limit} bytes")]
    TooLarge { limit: usize },

    #[error("chunk-size lines exceed the limit of {limit} bytes")]
    FramingTooLarge { limit: usize },

    #[error("trailer section exceeds the limit of {limit} bytes")]
    TrailersTooLarge { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Resumable decoder for one chunked body.
///
/// Three budgets apply: decoded data may not exceed `body_limit`, and the
/// chunk-size lines (extensions and CRLFs included) and the trailer section
/// may each not exceed `framing_limit` bytes on the wire.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use erica::http::chunked::ChunkedDecoder;
///
/// let mut buf = BytesMut::from(&b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\nNEXT"[..]);
/// let mut decoder = ChunkedDecoder::new(1024, 1024);
/// let body = decoder.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(&body[..], b"Wikipedia");
/// assert_eq!(&buf[..], b"NEXT");
/// ```
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    body: BytesMut,
    data: usize,
    framing: usize,
    trailer: usize,
    body_limit: usize,
    framing_limit: usize,
}

impl ChunkedDecoder {
    pub fn new(body_limit: usize, framing_limit: usize) -> Self {
        Self {
            state: State::Size,
            body: BytesMut::new(),
            data: 0,
            framing: 0,
            trailer: 0,
            body_limit,
            framing_limit,
        }
    }

    /// Wire bytes taken out of the buffer so far.
    pub fn consumed(&self) -> usize {
        self.framing + self.data + self.trailer
    }

    /// Takes as much of the body from the front of `buf` as is available.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Once the trailer section
    /// has ended the decoded body is returned and `buf` starts right after it.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkedError`] for malformed framing or an exceeded budget.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ChunkedError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line_len) = next_line(buf)? else {
                        self.charge_framing(buf.len())?;
                        return Ok(None);
                    };
                    let size = parse_size(&buf[..line_len])?;
                    self.charge_framing(line_len + 2)?;
                    if self.data.saturating_add(size) > self.body_limit {
                        return Err(ChunkedError::TooLarge {
                            limit: self.body_limit,
                        });
                    }
                    buf.advance(line_len + 2);
                    self.framing += line_len + 2;
                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::Data(size)
                    };
                }
                State::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buf.len());
                    self.body.put(buf.split_to(n));
                    self.data += n;
                    self.state = if n == remaining {
                        State::DataEnd
                    } else {
                        State::Data(remaining - n)
                    };
                }
                State::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ChunkedError::MissingTerminator);
                    }
                    self.charge_framing(2)?;
                    buf.advance(2);
                    self.framing += 2;
                    self.state = State::Size;
                }
                State::Trailer => {
                    let line = next_line(buf)?;
                    let framed = line.map_or(buf.len(), |len| len + 2);
                    if self.trailer.saturating_add(framed) > self.framing_limit {
                        return Err(ChunkedError::TrailersTooLarge {
                            limit: self.framing_limit,
                        });
                    }
                    let Some(line_len) = line else {
                        return Ok(None);
                    };
                    buf.advance(framed);
                    self.trailer += framed;
                    if line_len == 0 {
                        self.state = State::Done;
                    }
                }
                State::Done => return Ok(Some(mem::take(&mut self.body).freeze())),
            }
        }
    }

    // Fails if `extra` more framing bytes would exceed the budget.
    fn charge_framing(&self, extra: usize) -> Result<(), ChunkedError> {
        if self.framing.saturating_add(extra) > self.framing_limit {
            return Err(ChunkedError::FramingTooLarge {
                limit: self.framing_limit,
            });
        }
        Ok(())
    }
}

/// Appends one chunk to `buf`. Empty input writes nothing, since a zero-length
/// chunk would terminate the body.
pub fn encode_chunk(data: &[u8], buf: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    buf.put(format!("{:X}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

// Length of the line at the start of `buf`, excluding its CRLF.
fn next_line(buf: &[u8]) -> Result<Option<usize>, ChunkedError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(len) if len > MAX_LINE => Err(ChunkedError::LineTooLong),
        Some(len) => Ok(Some(len)),
        None if buf.len() > MAX_LINE => Err(ChunkedError::LineTooLong),
        None => Ok(None),
    }
}

fn parse_size(line: &[u8]) -> Result<usize, ChunkedError> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(ext) => line[..ext].trim_ascii_end(),
        None => line,
    };
    if digits.is_empty() || digits.len() > 15 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ChunkedError::InvalidSize);
    }
    let digits = std::str::from_utf8(digits).map_err(|_| ChunkedError::InvalidSize)?;
    usize::from_str_radix(digits, 16).map_err(|_| ChunkedError::InvalidSize)
}
