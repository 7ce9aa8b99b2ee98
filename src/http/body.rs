//! Response bodies: a buffered payload or a stream of chunks.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Number of chunks a streaming body buffers before [`BodySender::send`] waits.
const STREAM_CAPACITY: usize = 16;

/// A response body.
///
/// [`Body::Full`] has a known length and is framed with `Content-Length`.
/// [`Body::Stream`] is produced incrementally through a [`BodySender`] and is
/// framed with `Transfer-Encoding: chunked`.
#[derive(Debug)]
pub enum Body {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl Body {
    /// An empty, fixed-length body.
    pub fn empty() -> Self {
        Body::Full(Bytes::new())
    }

    /// Creates a streaming body and the sender that feeds it.
    ///
    /// The body ends when every [`BodySender`] clone has been dropped.
    pub fn channel() -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (BodySender { tx }, Body::Stream(rx))
    }

    /// Length in bytes, if known before writing.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Full(bytes) => Some(bytes.len()),
            Body::Stream(_) => None,
        }
    }

    /// Returns `true` for a zero-length [`Body::Full`]. Streams are never
    /// considered empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Full(bytes) if bytes.is_empty())
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// Returns the buffered bytes of a [`Body::Full`].
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Full(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Full(Bytes::from(text))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Full(Bytes::from_static(text.as_bytes()))
    }
}

/// The peer went away or the response was discarded before the stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("response body receiver dropped")]
pub struct BodyClosed;

/// Producer half of a streaming [`Body`].
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
}

impl BodySender {
    /// Sends one chunk, waiting while the stream buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`BodyClosed`] once the response writer has stopped reading,
    /// e.g. because the client disconnected.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), BodyClosed> {
        self.tx.send(chunk.into()).await.map_err(|_| BodyClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_body_length() {
        let body = Body::from("hello");
        assert_eq!(body.len(), Some(5));
        assert!(!body.is_empty());
        assert!(Body::empty().is_empty());
    }

    #[tokio::test]
    async fn channel_streams_until_senders_drop() {
        let (tx, body) = Body::channel();
        assert!(body.is_stream());
        assert_eq!(body.len(), None);

        let Body::Stream(mut rx) = body else {
            panic!("expected a stream body");
        };
        tokio::spawn(async move {
            tx.send("a").await.unwrap();
            tx.send(String::from("b")).await.unwrap();
        });

        assert_eq!(rx.recv().await.as_deref(), Some(&b"a"[..]));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"b"[..]));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn send_after_receiver_drop_fails() {
        let (tx, body) = Body::channel();
        drop(body);
        assert_eq!(tx.send("late").await, Err(BodyClosed));
    }
}
