//! End-to-end tests over real TCP sockets.

use std::net::SocketAddr;
use std::time::Duration;

use erica::{Context, HandlerError, Response, Server, ServerConfig, ServerError, ServerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn hello(_ctx: Context, res: Response) -> Result<Response, HandlerError> {
    Ok(res.json(&serde_json::json!({ "message": "Hello, World!" }))?)
}

async fn echo(ctx: Context, res: Response) -> Result<Response, HandlerError> {
    Ok(res.text(format!("you posted {}", ctx.text()?)))
}

async fn user(ctx: Context, res: Response) -> Result<Response, HandlerError> {
    let id = ctx.param("id").unwrap_or_default().to_owned();
    Ok(res.text(format!("user {id}")))
}

async fn fail(_ctx: Context, _res: Response) -> Result<Response, HandlerError> {
    Err(HandlerError::msg("storage offline"))
}

async fn explode(_ctx: Context, _res: Response) -> Result<Response, HandlerError> {
    panic!("handler bug")
}

async fn slow(_ctx: Context, res: Response) -> Result<Response, HandlerError> {
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(res.text("done"))
}

async fn start(config: ServerConfig) -> ServerHandle {
    init_tracing();
    let mut server = Server::new(config);
    server.get("/", hello).unwrap();
    server.post("/", echo).unwrap();
    server.get("/users/:id", user).unwrap();
    server.get("/fail", fail).unwrap();
    server.get("/panic", explode).unwrap();
    server.get("/slow", slow).unwrap();
    server.listen("127.0.0.1:0").await.unwrap()
}

// Sends `raw` on a fresh connection and reads until the server closes it.
async fn exchange(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

// Reads one Content-Length framed response; returns (head, body).
async fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    let head = String::from_utf8(head).unwrap();
    let len = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.unwrap();
    (head, String::from_utf8(body).unwrap())
}

#[tokio::test]
async fn get_root_returns_hello_json() {
    let server = start(ServerConfig::default()).await;
    let raw = exchange(
        server.local_addr(),
        "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"), "{raw}");
    assert!(raw.contains("Content-Type: application/json\r\n"));
    assert!(raw.contains("Content-Length: 28\r\n"));
    assert!(raw.contains("Date: "));
    assert!(raw.ends_with("\r\n\r\n{\"message\": \"Hello, World!\"}"));
    server.shutdown().await;
}

#[tokio::test]
async fn keep_alive_connection_serves_several_requests() {
    let server = start(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\n\r\nhi")
        .await
        .unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, "you posted hi");

    stream
        .write_all(b"GET /users/42?verbose=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let (_, body) = read_response(&mut stream).await;
    assert_eq!(body, "user 42");

    stream
        .write_all(b"GET /users/%C3%A9 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let (_, body) = read_response(&mut stream).await;
    assert_eq!(body, "user é");

    server.shutdown().await;
}

#[tokio::test]
async fn chunked_request_body_is_decoded() {
    let server = start(ServerConfig::default()).await;
    let raw = exchange(
        server.local_addr(),
        "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
         3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
    )
    .await;
    assert!(raw.ends_with("you posted abcde"), "{raw}");
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_path_is_404() {
    let server = start(ServerConfig::default()).await;
    let raw = exchange(
        server.local_addr(),
        "GET /nowhere HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\n"), "{raw}");
    server.shutdown().await;
}

#[tokio::test]
async fn wrong_method_is_405_with_allow() {
    let server = start(ServerConfig::default()).await;
    let raw = exchange(
        server.local_addr(),
        "DELETE / HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(raw.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{raw}");
    assert!(raw.contains("Allow: GET, POST\r\n"));
    server.shutdown().await;
}

#[tokio::test]
async fn failing_handler_gets_500_and_server_keeps_serving() {
    let server = start(ServerConfig::default()).await;

    for path in ["/fail", "/panic"] {
        // Keep-alive requested, but a 5xx closes the connection anyway.
        let raw = exchange(server.local_addr(), &format!("GET {path} HTTP/1.1\r\n\r\n")).await;
        assert!(raw.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{raw}");
        assert!(raw.contains("Connection: close\r\n"));
        assert!(!raw.contains("storage offline"));
    }

    let raw = exchange(
        server.local_addr(),
        "GET / HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    server.shutdown().await;
}

#[tokio::test]
async fn malformed_request_is_400() {
    let server = start(ServerConfig::default()).await;
    let raw = exchange(server.local_addr(), "GET /%zz HTTP/1.1\r\n\r\n").await;
    assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{raw}");
    assert!(raw.contains("Connection: close\r\n"));

    let raw = exchange(server.local_addr(), "GET / HTTP/2.0\r\n\r\n").await;
    assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{raw}");
    server.shutdown().await;
}

#[tokio::test]
async fn stalled_request_times_out() {
    let config = ServerConfig::default().with_read_timeout(Duration::from_millis(100));
    let server = start(config).await;
    let raw = exchange(server.local_addr(), "GET / HTTP/1.1\r\nHo").await;
    assert!(raw.starts_with("HTTP/1.1 408 Request Timeout\r\n"), "{raw}");
    server.shutdown().await;
}

#[tokio::test]
async fn second_listener_on_same_port_fails() {
    let first = start(ServerConfig::default()).await;
    let addr = first.local_addr().to_string();

    let mut second = Server::new(ServerConfig::default());
    let err = second.listen(&addr).await.unwrap_err();
    assert!(matches!(err, ServerError::AddressInUse { .. }), "{err:?}");
    first.shutdown().await;
}

#[tokio::test]
async fn max_connections_queues_excess_clients() {
    let server = start(ServerConfig::default().with_max_connections(1)).await;
    let addr = server.local_addr();

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    read_response(&mut first).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    second
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut byte = [0u8; 1];
    let waited = tokio::time::timeout(Duration::from_millis(200), second.read(&mut byte)).await;
    assert!(waited.is_err(), "second connection was served while the first held the slot");

    drop(first);
    let (head, _) = read_response(&mut second).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_finishes_in_flight_request_then_stops_accepting() {
    let server = start(ServerConfig::default()).await;
    let addr = server.local_addr();

    let mut busy = TcpStream::connect(addr).await.unwrap();
    busy.write_all(b"GET /slow HTTP/1.1\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown = tokio::spawn(server.shutdown());

    let mut out = Vec::new();
    busy.read_to_end(&mut out).await.unwrap();
    let raw = String::from_utf8(out).unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"), "{raw}");
    assert!(raw.contains("Connection: close\r\n"));
    assert!(raw.ends_with("done"));

    shutdown.await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn shutdown_aborts_connections_after_grace_period() {
    let config = ServerConfig::default().with_shutdown_grace_period(Duration::from_millis(50));
    let server = start(config).await;

    let mut busy = TcpStream::connect(server.local_addr()).await.unwrap();
    busy.write_all(b"GET /slow HTTP/1.1\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_millis(150), server.shutdown())
        .await
        .expect("shutdown should not wait for the slow handler");

    let mut out = Vec::new();
    let _ = busy.read_to_end(&mut out).await;
    assert!(out.is_empty());
}
