//! Strict percent-decoding for request targets (RFC 3986 §2.1).
//!
//! Unlike lenient decoders, a `%` that is not followed by two hex digits is an
//! error rather than being passed through, and the decoded octets must form
//! valid UTF-8.

use std::borrow::Cow;

use thiserror::Error;

/// Errors produced while percent-decoding a path or query component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid percent-encoding at byte {position}")]
    InvalidEscape { position: usize },

    #[error("percent-decoded bytes are not valid UTF-8")]
    InvalidUtf8,
}

/// Decodes `%XX` escapes in a path component.
///
/// Returns the input unchanged (borrowed) when it contains no escapes.
///
/// # Examples
///
/// ```
/// use erica::http::percent::percent_decode;
///
/// assert_eq!(percent_decode("/caf%C3%A9").unwrap(), "/café");
/// assert_eq!(percent_decode("/a+b").unwrap(), "/a+b");
/// assert!(percent_decode("/100%").is_err());
/// ```
pub fn percent_decode(input: &str) -> Result<Cow<'_, str>, DecodeError> {
    decode(input, false)
}

/// Decodes `%XX` escapes in a query key or value, treating `+` as a space
/// (`application/x-www-form-urlencoded`).
pub fn percent_decode_query(input: &str) -> Result<Cow<'_, str>, DecodeError> {
    decode(input, true)
}

fn decode(input: &str, plus_as_space: bool) -> Result<Cow<'_, str>, DecodeError> {
    let bytes = input.as_bytes();
    if !bytes
        .iter()
        .any(|&b| b == b'%' || (plus_as_space && b == b'+'))
    {
        return Ok(Cow::Borrowed(input));
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).copied().and_then(hex_value);
                let lo = bytes.get(i + 2).copied().and_then(hex_value);
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(DecodeError::InvalidEscape { position: i });
                };
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out)
        .map(Cow::Owned)
        .map_err(|_| DecodeError::InvalidUtf8)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
