//! URL query string parsing.

use super::percent::{DecodeError, percent_decode_query};

/// Decoded query parameters.
///
/// Keys may repeat; every value is kept, in the order it appeared in the
/// query string.
///
/// # Examples
///
/// ```
/// use erica::http::QueryParams;
///
/// let query = QueryParams::parse("tag=a&tag=b&q=hello+world").unwrap();
/// assert_eq!(query.get("q"), Some("hello world"));
/// assert_eq!(query.get_all("tag").collect::<Vec<_>>(), ["a", "b"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a raw query string (without the leading `?`).
    ///
    /// Pairs are split on `&` and `=` before decoding, so an encoded `%26` or
    /// `%3D` stays inside its key or value. Empty pairs are skipped and a key
    /// without `=` gets an empty value.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] on malformed percent-encoding.
    pub fn parse(query: &str) -> Result<Self, DecodeError> {
        let mut pairs = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            pairs.push((
                percent_decode_query(key)?.into_owned(),
                percent_decode_query(value)?.into_owned(),
            ));
        }
        Ok(Self { pairs })
    }

    /// Returns the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `key`, in order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Number of `(key, value)` pairs, counting repeated keys.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterates all pairs in query-string order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
