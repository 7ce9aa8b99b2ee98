//! Minimal erica server.
//!
//! ```text
//! cargo run --example hello_world
//! curl http://127.0.0.1:8080/
//! curl -d hi http://127.0.0.1:8080/
//! curl http://127.0.0.1:8080/users/42?greeting=hey
//! ```
//!
//! Set `RUST_LOG=erica=debug` to see connection lifecycle logs.

use std::time::Duration;

use erica::{Context, HandlerError, Response, Server, ServerConfig};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

async fn hello(_ctx: Context, res: Response) -> Result<Response, HandlerError> {
    Ok(res.json(&Message {
        message: "Hello, World!",
    })?)
}

async fn echo(ctx: Context, res: Response) -> Result<Response, HandlerError> {
    Ok(res.text(format!("you posted {}", ctx.text()?)))
}

async fn greet_user(ctx: Context, res: Response) -> Result<Response, HandlerError> {
    let id = ctx.param("id").unwrap_or("stranger");
    let greeting = ctx.request().query_param("greeting").unwrap_or("hello");
    Ok(res.text(format!("{greeting}, user {id}")))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("erica=info")),
        )
        .init();

    let config = ServerConfig::default()
        .with_read_timeout(Duration::from_secs(15))
        .with_max_connections(1024);

    let mut server = Server::new(config);
    server.get("/", hello)?;
    server.post("/", echo)?;
    server.get("/users/:id", greet_user)?;

    server.run("127.0.0.1:8080").await?;
    Ok(())
}
