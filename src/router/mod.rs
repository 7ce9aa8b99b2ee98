//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! This module provides [`Router`], which resolves an incoming `(method, path)`
//! to a registered handler. Patterns are made of literal and parameter segments:
//!
//! | Pattern                   | Example match        | Captured params              |
//! |---------------------------|----------------------|------------------------------|
//! | `/users`                  | `/users`             | *(none)*                     |
//! | `/users/:id`              | `/users/42`          | `id → "42"`                  |
//! | `/users/:id/posts/:post`  | `/users/7/posts/99`  | `id → "7"`, `post → "99"`    |
//!
//! A route only matches paths with the same number of segments. Empty segments
//! are ignored on both sides, so `/users/` and `/users` are equivalent. Paths
//! are compared case-sensitively.
//!
//! When several routes match, the one with a literal segment at the first
//! position where they differ wins; remaining ties go to the earliest
//! registration.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::error;

use crate::context::{Context, PathParams};
use crate::{Method, Request, Response, StatusCode};

pub mod handler;

pub use handler::{Handler, HandlerError, HandlerFuture, IntoHandler};

/// Errors raised while building a route table.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {method} {pattern} is already registered")]
    Duplicate { method: Method, pattern: String },

    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("routes cannot be registered after the server has started")]
    ServerAlreadyRunning,
}

/// Why [`Router::find`] produced no route.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("no route matches the request path")]
    NotFound,

    /// The path matches routes registered for other methods only.
    #[error("method not allowed (allowed: {allowed:?})")]
    MethodNotAllowed { allowed: Vec<Method> },
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

impl Segment {
    // Two segments occupy the same slot if both are parameters (names aside)
    // or both are the same literal.
    fn same_shape(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Static(a), Segment::Static(b)) => a == b,
            (Segment::Parameter(_), Segment::Parameter(_)) => true,
            _ => false,
        }
    }
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parse a route pattern string such as `"/users/:id"`.
    fn parse(pattern: &str) -> Result<Self, RouteError> {
        let invalid = |reason| RouteError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason,
        };

        if !pattern.starts_with('/') {
            return Err(invalid("pattern must start with `/`"));
        }

        let mut segments = Vec::new();
        for part in pattern.split('/').filter(|s| !s.is_empty()) {
            let segment = match part.strip_prefix(':') {
                Some("") => return Err(invalid("parameter name is empty")),
                Some(name) => {
                    let taken = segments
                        .iter()
                        .any(|s| matches!(s, Segment::Parameter(n) if n == name));
                    if taken {
                        return Err(invalid("parameter name is used twice"));
                    }
                    Segment::Parameter(name.to_owned())
                }
                None => Segment::Static(part.to_owned()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_owned(),
            segments,
        })
    }

    fn same_shape(&self, other: &Pattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.same_shape(b))
    }

    // Try to match the split path, returning extracted [`PathParams`] on success.
    fn matches(&self, path: &[&str]) -> Option<PathParams> {
        if self.segments.len() != path.len() {
            return None;
        }

        let mut params = PathParams::new();
        for (seg, path_seg) in self.segments.iter().zip(path) {
            match seg {
                Segment::Static(s) => {
                    if s != path_seg {
                        return None;
                    }
                }
                Segment::Parameter(name) => {
                    params.insert(name.clone(), (*path_seg).to_owned());
                }
            }
        }
        Some(params)
    }

    // `true` if, at the first position where the two differ, `self` has the
    // literal segment. Only meaningful for patterns matching the same path.
    fn outranks(&self, other: &Pattern) -> bool {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match (a, b) {
                (Segment::Static(_), Segment::Parameter(_)) => return true,
                (Segment::Parameter(_), Segment::Static(_)) => return false,
                _ => {}
            }
        }
        false
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A registered route binding a method + pattern to a handler.
pub struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The pattern as it was registered.
    pub fn pattern(&self) -> &str {
        &self.pattern.raw
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.raw)
            .finish_non_exhaustive()
    }
}

/// The route chosen for a request and the parameters it bound.
#[derive(Debug)]
pub struct RouteMatch<'r> {
    route: &'r Route,
    params: PathParams,
}

impl<'r> RouteMatch<'r> {
    pub fn route(&self) -> &'r Route {
        self.route
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn into_params(self) -> PathParams {
        self.params
    }
}

/// HTTP request router that resolves requests to registered handler functions.
///
/// # Examples
///
/// ```rust
/// use erica::{Context, Method, Response, Router};
/// use erica::router::MatchError;
///
/// let mut router = Router::new();
/// router.get("/ping", |_ctx: Context, res: Response| async move { Ok(res.text("pong")) })?;
/// router.get("/users/:id", |ctx: Context, res: Response| async move {
///     let id = ctx.param("id").unwrap_or("unknown").to_owned();
///     Ok(res.text(id))
/// })?;
///
/// let found = router.find(Method::Get, "/users/42").unwrap();
/// assert_eq!(found.params().get("id"), Some("42"));
/// assert_eq!(
///     router.find(Method::Post, "/ping").unwrap_err(),
///     MatchError::MethodNotAllowed { allowed: vec![Method::Get] }
/// );
/// # Ok::<(), erica::router::RouteError>(())
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use erica::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register `handler` for requests with `method` whose path matches `pattern`.
    ///
    /// # Errors
    ///
    /// - [`RouteError::InvalidPattern`]: `pattern` does not start with `/`, or
    ///   has an empty or repeated parameter name.
    /// - [`RouteError::Duplicate`]: a route with the same method and an
    ///   identical pattern exists. Parameter names do not distinguish patterns,
    ///   so `/users/:id` and `/users/:uid` collide. The table is left unchanged.
    pub fn register(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl IntoHandler,
    ) -> Result<(), RouteError> {
        let pattern = Pattern::parse(pattern)?;
        if let Some(existing) = self
            .routes
            .iter()
            .find(|r| r.method == method && r.pattern.same_shape(&pattern))
        {
            return Err(RouteError::Duplicate {
                method,
                pattern: existing.pattern.raw.clone(),
            });
        }

        self.routes.push(Route {
            method,
            pattern,
            handler: handler::erase(handler),
        });
        Ok(())
    }

    /// Register a handler for `GET` requests matching `pattern`.
    pub fn get(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Get, pattern, handler)
    }

    /// Register a handler for `POST` requests matching `pattern`.
    pub fn post(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Post, pattern, handler)
    }

    /// Register a handler for `PUT` requests matching `pattern`.
    pub fn put(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Put, pattern, handler)
    }

    /// Register a handler for `PATCH` requests matching `pattern`.
    pub fn patch(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Patch, pattern, handler)
    }

    /// Register a handler for `DELETE` requests matching `pattern`.
    pub fn delete(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Delete, pattern, handler)
    }

    /// Register a handler for `HEAD` requests matching `pattern`.
    pub fn head(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Head, pattern, handler)
    }

    /// Register a handler for `OPTIONS` requests matching `pattern`.
    pub fn options(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Options, pattern, handler)
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered routes in registration order.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Resolve `(method, path)` to the highest-priority route.
    ///
    /// # Errors
    ///
    /// - [`MatchError::MethodNotAllowed`]: the path matches, but only under
    ///   other methods; `allowed` lists them once each, in registration order.
    /// - [`MatchError::NotFound`]: no route matches the path at all.
    pub fn find(&self, method: Method, path: &str) -> Result<RouteMatch<'_>, MatchError> {
        let segments = split_path(path);
        let mut best: Option<RouteMatch<'_>> = None;
        let mut allowed = Vec::new();

        for route in &self.routes {
            let Some(params) = route.pattern.matches(&segments) else {
                continue;
            };
            if route.method != method {
                if !allowed.contains(&route.method) {
                    allowed.push(route.method);
                }
                continue;
            }
            let replace = match &best {
                Some(current) => route.pattern.outranks(&current.route.pattern),
                None => true,
            };
            if replace {
                best = Some(RouteMatch { route, params });
            }
        }

        best.ok_or(if allowed.is_empty() {
            MatchError::NotFound
        } else {
            MatchError::MethodNotAllowed { allowed }
        })
    }

    /// Route `request` and run the matched handler, always producing a response.
    ///
    /// - No matching path → `404 Not Found`.
    /// - Path matches under other methods only → `405 Method Not Allowed` with
    ///   an `Allow` header.
    /// - The handler returns an error or panics → the failure is logged and a
    ///   `500 Internal Server Error` is returned instead.
    ///
    /// The handler runs on its own Tokio task so a panic cannot unwind into
    /// the connection that called it.
    pub async fn dispatch(&self, request: Request) -> Response {
        let method = request.method();
        let (handler, params) = match self.find(method, request.path()) {
            Ok(found) => (found.route.handler.clone(), found.into_params()),
            Err(MatchError::NotFound) => {
                return Response::new(StatusCode::NOT_FOUND).text("Not Found");
            }
            Err(MatchError::MethodNotAllowed { allowed }) => {
                let allow = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Response::new(StatusCode::METHOD_NOT_ALLOWED)
                    .header("Allow", allow)
                    .text("Method Not Allowed");
            }
        };

        let path = request.path().to_owned();
        let ctx = Context::with_params(request, params);
        let task = AbortOnDrop(tokio::spawn(handler(ctx, Response::default())));
        match task.await {
            Ok(Ok(response)) => match response.headers().validate() {
                Ok(()) => response,
                Err(err) => {
                    error!(%method, %path, error = %err, "handler set an unsendable header");
                    internal_error()
                }
            },
            Ok(Err(err)) => {
                error!(%method, %path, error = %err, "handler failed");
                internal_error()
            }
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                error!(%method, %path, panic = panic_message(&*payload), "handler panicked");
                internal_error()
            }
            Err(join_err) => {
                error!(%method, %path, error = %join_err, "handler task cancelled");
                internal_error()
            }
        }
    }
}

// Handler task that is cancelled when the dispatch awaiting it is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn internal_error() -> Response {
    Response::new(StatusCode::INTERNAL_SERVER_ERROR).text("Internal Server Error")
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
