//! # erica
//!
//! A small async HTTP/1.1 server with method + path routing.
//!
//! Handlers are async functions taking a [`Context`] (the parsed request and
//! its path parameters) and a fresh [`Response`], returning the response to
//! send or a [`HandlerError`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use erica::{Context, HandlerError, Response, Server, ServerConfig};
//!
//! async fn hello(_ctx: Context, res: Response) -> Result<Response, HandlerError> {
//!     Ok(res.json(&serde_json::json!({ "message": "Hello, World!" }))?)
//! }
//!
//! async fn echo(ctx: Context, res: Response) -> Result<Response, HandlerError> {
//!     Ok(res.text(format!("you posted {}", ctx.text()?)))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default());
//!     server.get("/", hello)?;
//!     server.post("/", echo)?;
//!     server.run("127.0.0.1:8080").await?;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod http;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::{Context, PathParams};
pub use http::{Body, BodySender, Headers, Method, Request, Response, StatusCode};
pub use router::{HandlerError, IntoHandler, Router};
pub use server::{Server, ServerConfig, ServerError, ServerHandle};
