//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP headers are order-preserving and case-insensitive per [RFC 9110 §5].

use thiserror::Error;

/// A header field that cannot be put on the wire as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidHeader {
    #[error("header name {0:?} is not a token")]
    Name(String),

    #[error("value of header `{0}` contains a control character")]
    Value(String),
}

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order and allows multiple values per header name,
/// matching the semantics of HTTP/1.1 header fields (RFC 9110 §5.3). Names are
/// stored as given; the request parser lower-cases them before insertion.
///
/// # Examples
///
/// ```
/// use erica::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html; charset=utf-8");
/// headers.insert("X-Custom", "first");
/// headers.insert("X-Custom", "second");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// let all: Vec<_> = headers.get_all("x-custom").collect();
/// assert_eq!(all, vec!["first", "second"]);
///
/// headers.set("x-custom", "only");
/// assert_eq!(headers.get_all("X-Custom").count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single `value`.
    ///
    /// The entry keeps the position of the first existing occurrence, so
    /// overriding a header does not reorder the output. If the name is absent
    /// the entry is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .inner
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(first) => {
                let mut index = 0;
                self.inner.retain(|(k, _)| {
                    let keep = index <= first || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
                self.inner[first] = (name, value);
            }
            None => self.inner.push((name, value)),
        }
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any value of `name`, read as a comma-separated list,
    /// contains `token` (case-insensitive).
    ///
    /// Used for list-valued fields such as `Connection` and `Transfer-Encoding`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Checks that every entry can be written verbatim as a field line.
    ///
    /// # Errors
    ///
    /// Returns the first entry whose name is not a token, or whose value
    /// contains CR, LF, NUL or another control character other than HTAB.
    pub fn validate(&self) -> Result<(), InvalidHeader> {
        for (name, value) in &self.inner {
            if name.is_empty() || !name.bytes().all(is_tchar) {
                return Err(InvalidHeader::Name(name.clone()));
            }
            if !is_field_value(value) {
                return Err(InvalidHeader::Value(name.clone()));
            }
        }
        Ok(())
    }
}

// RFC 9110 §5.6.2 tchar.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

// Visible characters, SP, HTAB and obs-text; never CR, LF or NUL.
fn is_field_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn multi_value() {
        let mut h = Headers::new();
        h.insert("Set-Cookie", "a=1");
        h.insert("Set-Cookie", "b=2");
        let vals: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(vals, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut h = Headers::new();
        h.insert("X-A", "1");
        h.insert("X-Dup", "first");
        h.insert("X-B", "2");
        h.insert("x-dup", "second");
        h.set("X-Dup", "only");

        let pairs: Vec<_> = h.iter().collect();
        assert_eq!(pairs, vec![("X-A", "1"), ("X-Dup", "only"), ("X-B", "2")]);
    }

    #[test]
    fn set_appends_when_absent() {
        let mut h = Headers::new();
        h.insert("X-A", "1");
        h.set("X-B", "2");
        assert_eq!(h.iter().last(), Some(("X-B", "2")));
    }

    #[test]
    fn token_lists() {
        let mut h = Headers::new();
        h.insert("Connection", "Upgrade, Keep-Alive");
        assert!(h.has_token("connection", "keep-alive"));
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.insert("X-Foo", "bar");
        h.insert("X-Foo", "baz");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }

    #[test]
    fn validate_accepts_ordinary_fields() {
        let mut h = Headers::new();
        h.insert("X-Request-Id", "abc-123");
        h.insert("Content-Disposition", "attachment;\tfilename=\"café.txt\"");
        assert_eq!(h.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_line_breaks_in_values() {
        let mut h = Headers::new();
        h.insert("X-Note", "a\r\nContent-Length: 0\r\n\r\nHTTP/1.1 200 OK");
        assert_eq!(h.validate(), Err(InvalidHeader::Value("X-Note".into())));

        let mut h = Headers::new();
        h.insert("X-Note", "nul\0byte");
        assert_eq!(h.validate(), Err(InvalidHeader::Value("X-Note".into())));
    }

    #[test]
    fn validate_rejects_non_token_names() {
        for name in ["", "X Note", "X-Note:", "X-Note\r\nInjected"] {
            let mut h = Headers::new();
            h.insert(name, "v");
            assert_eq!(h.validate(), Err(InvalidHeader::Name(name.into())), "{name:?}");
        }
    }
}
