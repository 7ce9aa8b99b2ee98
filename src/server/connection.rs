//! One accepted connection, served until either side ends it.
//!
//! Requests are read and answered strictly in order. Bytes that arrive past
//! the end of one request stay buffered and become the start of the next.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::{ServerConfig, wait_for_shutdown};
use crate::http::response::Framing;
use crate::http::{ParseError, Parsed, Request, RequestDecoder, Response, StatusCode};
use crate::{Method, Router};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

// Why no request could be read.
#[derive(Debug)]
enum ReadFailure {
    Malformed(ParseError),
    // Part of a request arrived, but not all of it in time.
    TimedOut,
    Io(io::Error),
}

pub(crate) struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    shutdown: watch::Receiver<bool>,
    buf: BytesMut,
    decoder: RequestDecoder,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        stream: S,
        peer: SocketAddr,
        router: Arc<Router>,
        config: Arc<ServerConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            peer,
            router,
            decoder: RequestDecoder::new(config.limits()),
            config,
            shutdown,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        }
    }

    /// Serves requests until the peer leaves, a request fails to parse, a
    /// response ends the exchange, or the server shuts down.
    pub(crate) async fn serve(mut self) {
        loop {
            let request = match self.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(failure) => {
                    self.reject(failure).await;
                    break;
                }
            };

            if !self.respond(request).await {
                break;
            }
        }

        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "socket shutdown failed");
        }
        debug!(peer = %self.peer, "connection closed");
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // `Ok(None)` means the connection ended cleanly between requests.
    //
    // The head must arrive within one `read_timeout` of the call, counting
    // any idle wait before it, and the body within one more.
    async fn read_request(&mut self) -> Result<Option<Request>, ReadFailure> {
        let read_timeout = self.config.read_timeout;
        let mut deadline = Instant::now() + read_timeout;
        let mut in_body = false;
        let mut continue_sent = false;

        loop {
            let state = match self.decoder.decode(&mut self.buf) {
                Ok(Parsed::Complete(request, _)) => return Ok(Some(request)),
                Ok(state) => state,
                Err(e) => return Err(ReadFailure::Malformed(e)),
            };

            if let Parsed::NeedBody {
                expect_continue, ..
            } = state
            {
                if !in_body {
                    in_body = true;
                    deadline = Instant::now() + read_timeout;
                }
                if expect_continue && !continue_sent {
                    self.stream
                        .write_all(CONTINUE)
                        .await
                        .map_err(ReadFailure::Io)?;
                    self.stream.flush().await.map_err(ReadFailure::Io)?;
                    continue_sent = true;
                }
            }

            let idle = self.buf.is_empty() && self.decoder.is_idle();
            if idle && self.shutting_down() {
                return Ok(None);
            }

            let read = tokio::select! {
                read = timeout_at(deadline, self.stream.read_buf(&mut self.buf)) => read,
                _ = wait_for_shutdown(&mut self.shutdown), if idle => {
                    debug!(peer = %self.peer, "closing idle connection for shutdown");
                    return Ok(None);
                }
            };

            match read {
                Ok(Ok(0)) if idle => return Ok(None),
                Ok(Ok(0)) => {
                    let err = state.eof_error().unwrap_or(ParseError::TruncatedHead);
                    return Err(ReadFailure::Malformed(err));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(ReadFailure::Io(e)),
                Err(_elapsed) if idle => {
                    debug!(peer = %self.peer, "idle connection timed out");
                    return Ok(None);
                }
                Err(_elapsed) => return Err(ReadFailure::TimedOut),
            }
        }
    }

    // Answers a request that could not be read, if the socket still works.
    async fn reject(&mut self, failure: ReadFailure) {
        let response = match failure {
            ReadFailure::Malformed(err) => {
                let status = err.status();
                warn!(peer = %self.peer, error = %err, status = status.as_u16(), "rejecting malformed request");
                Response::new(status).text(format!("{}: {err}", status.canonical_reason()))
            }
            ReadFailure::TimedOut => {
                warn!(peer = %self.peer, "request timed out");
                Response::new(StatusCode::REQUEST_TIMEOUT).text("Request Timeout")
            }
            ReadFailure::Io(e) => {
                debug!(peer = %self.peer, error = %e, "read failed");
                return;
            }
        };

        let response = response.keep_alive(false);
        if let Err(e) = response.write_to(&mut self.stream, Framing::default()).await {
            warn!(peer = %self.peer, error = %e, "failed to send error response");
        }
    }

    // Routes one request and writes the response. Returns whether the
    // connection stays open.
    async fn respond(&mut self, request: Request) -> bool {
        let started = Instant::now();
        let method = request.method();
        let path = request.path().to_owned();
        let framing = Framing {
            omit_body: method == Method::Head,
            http10: request.version() == 0,
        };
        let wants_keep_alive = request.is_keep_alive();

        let mut response = self.router.dispatch(request).await;
        let status = response.status();

        let keep_alive = self.config.keep_alive
            && wants_keep_alive
            && !status.is_server_error()
            && !response.requests_close()
            && !(framing.http10 && response.payload().is_stream())
            && !self.shutting_down();
        response.set_keep_alive(keep_alive);

        if let Err(e) = response.write_to(&mut self.stream, framing).await {
            warn!(peer = %self.peer, %method, %path, error = %e, "failed to write response");
            return false;
        }

        info!(
            peer = %self.peer,
            %method,
            %path,
            status = status.as_u16(),
            elapsed = ?started.elapsed(),
            "request completed"
        );
        keep_alive
    }
}
