//! Async TCP front end using Tokio.
//!
//! Accepts TCP connections, parses one HTTP/1.1 request per connection and
//! submits it to an [`HttpService`]. The dispatch core runs on its own OS
//! threads; a response stage reads the service's output pipe and completes
//! the waiting connection through a `oneshot` channel keyed by context id.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::context::HttpContext;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::pipeline::{Stage, StageHandle};
use crate::service::{HttpService, ServiceError, Submitter};

/// Errors produced by the server.
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

    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The restline HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use restline::{HttpService, Method, Route, ServiceConfig};
/// use restline::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut service = HttpService::new(ServiceConfig::default())?;
///     service.register(Route::from_fn(Method::Get, "/", "default", |ctx| {
///         ctx.response_mut().set_body("Hello!");
///         Ok(())
///     }))?;
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(service, async { let _ = tokio::signal::ctrl_c().await; }).await?;
///     Ok(())
/// }
/// ```
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

    /// Starts `service` and serves connections until `shutdown` resolves.
    ///
    /// On shutdown the listener is closed and the service is stopped; requests
    /// still in flight are answered with `503`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Service`] if the service cannot start.
    pub async fn run<S>(self, mut service: HttpService, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let output = service.start()?;
        let pending: Pending = Arc::default();
        let writer = ResponseWriter {
            output,
            pending: Arc::clone(&pending),
        };
        let writer = match StageHandle::start("restline-responder", writer, service.config().poll_timeout()) {
            Ok(handle) => handle,
            Err(e) => {
                service.stop();
                return Err(ServiceError::from(e).into());
            }
        };
        let submitter = service.submitter();
        info!(address = %self.local_addr, "restline listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    debug!(peer = %peer_addr, "connection accepted");
                    let submitter = submitter.clone();
                    let pending = Arc::clone(&pending);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, submitter, pending).await {
                            warn!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        info!(address = %self.local_addr, "shutting down");
        drop(self.listener);
        // joining stage threads blocks
        let stopped = tokio::task::spawn_blocking(move || {
            service.stop();
            drop(writer);
        })
        .await;
        if let Err(e) = stopped {
            error!(error = %e, "service shutdown task failed");
        }
        Ok(())
    }
}

/// Reads one request, waits for the service to answer it, writes the
/// response and closes the connection.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    submitter: Submitter,
    pending: Pending,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    let request = loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            return Ok(());
        }

        if buf.len() > MAX_REQUEST_SIZE {
            return reject(&mut stream, peer_addr, StatusCode::PayloadTooLarge, "Request entity too large").await;
        }

        let (mut request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                return reject(&mut stream, peer_addr, StatusCode::BadRequest, &format!("Bad Request: {e}")).await;
            }
        };

        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset.saturating_add(content_length);
        if total_needed > MAX_REQUEST_SIZE {
            return reject(&mut stream, peer_addr, StatusCode::PayloadTooLarge, "Request entity too large").await;
        }
        if buf.len() < total_needed {
            continue;
        }

        request.truncate_body(content_length);
        break request;
    };

    debug!(
        peer = %peer_addr,
        method = %request.method(),
        path = %request.path(),
        "dispatching request"
    );

    let response = submit(request, &submitter, &pending).await;
    stream.write_all(&response.keep_alive(false).into_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn reject(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    status: StatusCode,
    message: &str,
) -> Result<(), std::io::Error> {
    warn!(peer = %peer_addr, status = status.as_u16(), "rejecting request");
    let response = Response::new(status).body(message).keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}

fn unavailable() -> Response {
    Response::new(StatusCode::ServiceUnavailable).body("Service Unavailable")
}

async fn submit(request: Request, submitter: &Submitter, pending: &Pending) -> Response {
    let ctx = HttpContext::new(request);
    let id = ctx.id();
    let (tx, rx) = oneshot::channel();
    lock(pending).insert(id, tx);

    if let Err(e) = submitter.try_submit(ctx) {
        lock(pending).remove(&id);
        warn!(request_id = id, error = %e, "service rejected request");
        return unavailable();
    }

    rx.await.unwrap_or_else(|_| {
        warn!(request_id = id, "request dropped before completion");
        unavailable()
    })
}

/// Completes waiting connections from the service output pipe.
struct ResponseWriter {
    output: Receiver<HttpContext>,
    pending: Pending,
}

impl Stage for ResponseWriter {
    fn execute(&mut self, poll: Duration) {
        match self.output.recv_timeout(poll) {
            Ok(ctx) => {
                let id = ctx.id();
                let Some(waiter) = lock(&self.pending).remove(&id) else {
                    warn!(request_id = id, "no connection waiting for response");
                    return;
                };
                if waiter.send(ctx.into_response()).is_err() {
                    debug!(request_id = id, "client went away before response");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(poll),
        }
    }

    fn finalize(&mut self) {
        // waiting connections get a 503
        lock(&self.pending).clear();
    }
}
