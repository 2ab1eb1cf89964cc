//! Async TCP listener using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function. Supports persistent connections (keep-alive) and stops when a
//! [`watch`] shutdown signal fires; the lifecycle around the listener — the
//! dedicated worker thread and the deadline-bounded join — lives in
//! [`crate::fixtures::FixtureServer`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server worker exited before reporting its address")]
    WorkerExited,
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The embedded HTTP listener.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function until told to shut down.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and dispatches requests to `handler` until
    /// `shutdown` fires.
    ///
    /// The handler receives a [`Request`] and must return a [`Future`] that
    /// resolves to a [`Response`]. It is wrapped in an [`Arc`] and shared
    /// across all spawned connection tasks, so it must be
    /// `Send + Sync + 'static`.
    ///
    /// Returns once the shutdown signal changes or its sender is dropped,
    /// after draining in-flight work: every connection task observes the
    /// same signal, finishes any request it is currently serving (the
    /// response is still written), closes its connection, and is awaited
    /// before this method returns.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(
        self,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut connections = JoinSet::new();
        info!(address = %self.local_addr, "mock server listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(address = %self.local_addr, "shutdown requested — leaving accept loop");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    debug!(peer = %peer_addr, "connection accepted");
                    let handler = Arc::clone(&handler);
                    let conn_shutdown = shutdown.clone();

                    connections.spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer_addr, handler, conn_shutdown).await
                        {
                            warn!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        // Drain: connection tasks break out of their idle reads on the same
        // signal, so this does not wait on open keep-alive connections.
        while connections.join_next().await.is_some() {}
        info!(address = %self.local_addr, "all connections drained");
        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or the shutdown signal fires. Shutdown is only
/// checked while waiting for the next request, so a request already being
/// served completes and its response is written before the connection
/// closes.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = tokio::select! {
            _ = shutdown.changed() => {
                debug!(peer = %peer_addr, "shutdown requested — closing connection");
                break;
            }
            read = stream.read_buf(&mut buf) => read?,
        };

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large — sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received — read more data.
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await;
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close — shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_reports_local_addr() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn bind_failure_is_surfaced() {
        let taken = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().to_string();
        let err = Server::bind(&addr).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().contains(&addr));
    }

    #[tokio::test]
    async fn run_returns_on_shutdown_signal() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(server.run(
            |_req| async { Response::new(StatusCode::Ok) },
            rx,
        ));

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_returns_when_shutdown_sender_is_dropped() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(server.run(
            |_req| async { Response::new(StatusCode::Ok) },
            rx,
        ));

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_on_idle_keep_alive_connections() {
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(server.run(
            |_req| async { Response::new(StatusCode::Ok).body("ok") },
            rx,
        ));

        // Establish a keep-alive connection and leave it idle.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut first = [0u8; 512];
        let n = stream.read(&mut first).await.unwrap();
        assert!(n > 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("drain must not hang on an idle connection")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn in_flight_request_completes_during_shutdown() {
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::sync::mpsc;

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (tx, rx) = watch::channel(false);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(server.run(
            move |_req| {
                let started = started_tx.clone();
                async move {
                    let _ = started.send(());
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Response::new(StatusCode::Ok).body("done")
                }
            },
            rx,
        ));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        // Fire shutdown only once the handler is actually running.
        started_rx.recv().await.unwrap();
        tx.send(true).unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("done"));

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
