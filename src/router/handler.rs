//! Route handler plumbing: the type-erased handler and the error it may return.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::http::Response;

/// The boxed future every handler is erased to.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send>>;

/// Type-erased, heap-allocated async handler that receives a [`Context`] and a
/// fresh [`Response`] and returns the response to send.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// threads without copying the underlying closure. In practice you never construct this
/// type directly; use [`Router::register`](super::Router::register) or one of the
/// method-specific helpers instead.
pub type Handler = Arc<dyn Fn(Context, Response) -> HandlerFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context, Response) -> impl Future<Output = Result<Response, HandlerError>> + Send`
/// that is also `Send + Sync + 'static` implements this trait automatically via the
/// blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler, boxing the returned future.
    fn call(&self, ctx: Context, response: Response) -> HandlerFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context, Response) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: Context, response: Response) -> HandlerFuture {
        Box::pin((self)(ctx, response))
    }
}

pub(crate) fn erase(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx, response| handler.call(ctx, response))
}

/// A failure reported by a route handler.
///
/// Any error type converts into it with `?`, so handlers can propagate
/// parsing or I/O failures directly. The server logs it and answers with
/// `500 Internal Server Error`; the error text is never sent to the client.
///
/// # Examples
///
/// ```
/// use erica::{Context, HandlerError, Response};
///
/// async fn create(ctx: Context, res: Response) -> Result<Response, HandlerError> {
///     let payload: serde_json::Value = ctx.json()?;
///     if payload.get("name").is_none() {
///         return Err(HandlerError::msg("missing name"));
///     }
///     Ok(res.json(&payload)?)
/// }
/// ```
pub struct HandlerError {
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl HandlerError {
    /// Creates an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: message.into().into(),
        }
    }

    /// The underlying error.
    pub fn source_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.inner
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            inner: Box::new(err),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_std_errors() {
        let parse_err = "x".parse::<u32>().unwrap_err();
        let err = HandlerError::from(parse_err);
        assert_eq!(err.to_string(), "invalid digit found in string");
    }

    #[test]
    fn message_errors() {
        let err = HandlerError::msg("boom");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.source_ref().to_string(), "boom");
    }
}
