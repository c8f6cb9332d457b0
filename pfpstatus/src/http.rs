//! HTTP exposure of the recorded statuses.
//!
//! Served from a plain `std::net::TcpListener`, one thread per connection.
//! Endpoints:
//!
//! - `GET /pfpstatus`: number of known nodes (JSON)
//! - `GET /pfpstatus/<nodeName>`: recorded statuses of one node (JSON)
//!
//! Requests flow through a [`Handler`] pipeline: the router at the bottom,
//! wrapped by each registered [`Middleware`] in order, so the last registered
//! middleware is the outermost one and runs first.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, ServeError};
use crate::setup::Environ;
use crate::shutdown::Shutdown;

/// Path of the summary endpoint.
pub const STATUS_PATH: &str = "/pfpstatus";

/// How long a connection may stay silent before it is dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the accept loop re-checks cancellation when idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on the size of a request line plus headers.
const MAX_REQUEST_HEAD_BYTES: u64 = 16 * 1024;

/// Upper bound on input discarded after refusing a request.
const MAX_DRAIN_BYTES: u64 = 64 * 1024;

/// Default number of connections served at once.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// How long the accept loop may block answering a refused connection.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// A parsed HTTP request, as seen by handlers.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
    /// Address of the peer that sent the request.
    pub remote_addr: SocketAddr,
}

impl Request {
    /// Creates a `GET` request for `path` with no headers.
    pub fn get(path: impl Into<String>, remote_addr: SocketAddr) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            headers: Vec::new(),
            remote_addr,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Value of the `Content-Type` header.
    pub content_type: &'static str,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// Creates a JSON response.
    pub fn json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: "application/json; charset=UTF-8",
            body,
        }
    }

    /// Creates a plain-text response.
    pub fn text(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: format!("{message}\n").into_bytes(),
        }
    }

    /// Serializes `content` into a `200 OK` JSON response.
    ///
    /// A serialization failure becomes a `500` without detail.
    pub fn ok_json<T: Serialize + ?Sized>(content: &T, endpoint: &str) -> Self {
        match serde_json::to_vec(content) {
            Ok(body) => Self::json(200, body),
            Err(e) => {
                tracing::error!(endpoint, error = %e, "cannot serialize content");
                Self::text(500, "Internal Server Error")
            }
        }
    }

    /// Returns the body as UTF-8 text, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Something that turns a request into a response.
pub trait Handler: Send + Sync {
    /// Handles one request.
    fn handle(&self, request: &Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Response + Send + Sync,
{
    fn handle(&self, request: &Request) -> Response {
        self(request)
    }
}

type LinkFn = dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync;

/// A named handler wrapper; it may short-circuit the handler it wraps.
#[derive(Clone)]
pub struct Middleware {
    /// Name used in logs.
    pub name: String,
    link: Arc<LinkFn>,
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Middleware {
    /// Creates a middleware from a wrapping function.
    pub fn new<F>(name: impl Into<String>, link: F) -> Self
    where
        F: Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            link: Arc::new(link),
        }
    }

    /// Wraps `next`.
    pub fn link(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        (self.link)(next)
    }
}

/// Wraps `handler` with every middleware, first registered innermost.
pub fn compose(handler: Arc<dyn Handler>, middlewares: &[Middleware]) -> Arc<dyn Handler> {
    middlewares.iter().fold(handler, |next, mw| {
        tracing::info!(name = %mw.name, "linking middleware");
        mw.link(next)
    })
}

/// Builds the full request pipeline over `env`.
pub fn pipeline(env: Arc<Environ>, middlewares: &[Middleware]) -> Arc<dyn Handler> {
    compose(Arc::new(StatusRouter::new(env)), middlewares)
}

/// Routes requests to the status endpoints.
#[derive(Debug)]
pub struct StatusRouter {
    env: Arc<Environ>,
}

impl StatusRouter {
    /// Creates a router reading from `env`.
    pub fn new(env: Arc<Environ>) -> Self {
        Self { env }
    }

    /// `GET /pfpstatus`: returns how many nodes are known.
    fn main_handler(&self) -> Response {
        #[derive(Serialize)]
        struct Summary {
            nodes: usize,
        }

        // the guard is dropped before serializing
        let nodes = match self.env.count_nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(error = %e, "cannot read recorder");
                return Response::text(500, "Internal Server Error");
            }
        };
        Response::ok_json(&Summary { nodes }, "generic")
    }

    /// `GET /pfpstatus/<nodeName>`: returns the statuses of one node.
    fn node_handler(&self, node_name: &str) -> Response {
        if node_name.is_empty() {
            tracing::info!("requested pfpstatus for empty node");
            return Response::text(422, "missing node name");
        }
        let (content, found) = match self.env.content_for_node(node_name) {
            Ok(res) => res,
            Err(e) => {
                tracing::error!(error = %e, "cannot read recorder");
                return Response::text(500, "Internal Server Error");
            }
        };
        if !found {
            tracing::debug!(node = node_name, "requested pfpstatus for unknown node");
            return Response::text(422, "unknown node name");
        }
        Response::ok_json(&content, node_name)
    }
}

impl Handler for StatusRouter {
    fn handle(&self, request: &Request) -> Response {
        let route = if request.path == STATUS_PATH {
            Route::Main
        } else if let Some(node) = request
            .path
            .strip_prefix(STATUS_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|node| !node.contains('/'))
        {
            Route::Node(node)
        } else {
            return Response::text(404, "404 page not found");
        };

        if request.method != "GET" {
            return Response::text(405, "Method Not Allowed");
        }

        match route {
            Route::Main => self.main_handler(),
            Route::Node(node) => self.node_handler(node),
        }
    }
}

enum Route<'a> {
    Main,
    Node(&'a str),
}

/// A bound listener, ready to serve a pipeline.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    max_connections: usize,
}

impl Server {
    /// Binds `addr` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Bind`] if the address cannot be bound.
    pub fn bind(addr: &str) -> Result<Self> {
        let bind_err = |source| ServeError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        tracing::info!(addr = %local, "starting PFP server");
        Ok(Self {
            listener,
            addr: local,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    /// Sets how many connections may be served at once.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts connections until `shutdown` fires, one thread per connection.
    ///
    /// Connections beyond the configured limit are answered `503` from the
    /// accept loop and closed.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Listener`] if the listener cannot be switched to
    /// non-blocking mode.
    pub fn run(self, handler: Arc<dyn Handler>, shutdown: &Shutdown) -> Result<()> {
        self.listener
            .set_nonblocking(true)
            .map_err(|source| ServeError::Listener { source })?;

        let active = Arc::new(AtomicUsize::new(0));
        while !shutdown.is_cancelled() {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    continue;
                }
            };

            let Some(slot) = ConnectionSlot::acquire(&active, self.max_connections) else {
                tracing::warn!(peer = %peer, limit = self.max_connections, "too many connections");
                if let Err(e) = reject_busy(&stream) {
                    tracing::debug!(peer = %peer, error = %e, "cannot reject connection");
                }
                continue;
            };

            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name("pfpstatus-conn".to_string())
                .spawn(move || {
                    let _slot = slot;
                    if let Err(e) = serve_connection(stream, peer, handler.as_ref()) {
                        tracing::debug!(peer = %peer, error = %e, "request error");
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!(peer = %peer, error = %e, "cannot spawn connection thread");
            }
        }

        tracing::info!(addr = %self.addr, "PFP server stopped");
        Ok(())
    }

    /// Runs [`Server::run`] on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Spawn`] if the thread cannot be created.
    pub fn spawn(self, handler: Arc<dyn Handler>, shutdown: Shutdown) -> Result<JoinHandle<()>> {
        let name = "pfpstatus-http".to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = self.run(handler, &shutdown) {
                    tracing::error!(error = %e, "cannot serve PFP status");
                }
            })
            .map_err(|source| ServeError::Spawn { name, source }.into())
    }
}

/// One unit of the connection limit, released on drop.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Answers `503` on a connection the server has no room for.
fn reject_busy(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(REJECT_WRITE_TIMEOUT))?;
    write_response(stream, &Response::text(503, "Service Unavailable"))
}

/// Why a request head was refused before reaching the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejected {
    /// Not a parseable HTTP/1.x request head.
    Malformed,
    /// The head did not end within [`MAX_REQUEST_HEAD_BYTES`].
    TooLarge,
}

impl Rejected {
    fn response(self) -> Response {
        match self {
            Self::Malformed => Response::text(400, "Bad Request"),
            Self::TooLarge => Response::text(431, "Request Header Fields Too Large"),
        }
    }
}

/// Reads one request from `stream`, runs it through `handler` and replies.
fn serve_connection(stream: TcpStream, peer: SocketAddr, handler: &dyn Handler) -> io::Result<()> {
    // accepted sockets may inherit the listener's non-blocking mode
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut reader = BufReader::new(&stream);
    match read_request(&mut reader, peer)? {
        Ok(request) => {
            tracing::debug!(peer = %peer, method = %request.method, path = %request.path, "request");
            write_response(&stream, &handler.handle(&request))
        }
        Err(rejected) => {
            tracing::debug!(peer = %peer, ?rejected, "rejecting request");
            write_response(&stream, &rejected.response())?;
            // unread input would turn the close into a reset and lose the reply
            stream.shutdown(std::net::Shutdown::Write)?;
            io::copy(&mut reader.take(MAX_DRAIN_BYTES), &mut io::sink())?;
            Ok(())
        }
    }
}

/// Parses the request line and headers.
///
/// Nothing is dispatched unless the whole head, blank line included, fits in
/// [`MAX_REQUEST_HEAD_BYTES`] and is valid UTF-8.
fn read_request<R: BufRead>(
    reader: &mut R,
    peer: SocketAddr,
) -> io::Result<std::result::Result<Request, Rejected>> {
    let mut budget = MAX_REQUEST_HEAD_BYTES;

    let request_line = match read_head_line(reader, &mut budget)? {
        Ok(Some(line)) => line,
        Ok(None) => return Ok(Err(Rejected::Malformed)),
        Err(rejected) => return Ok(Err(rejected)),
    };

    // Parse: "GET /path?query HTTP/1.x"
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(Err(Rejected::Malformed));
    }
    let path = parts[1].split_once('?').map_or(parts[1], |(p, _)| p);

    let mut headers = Vec::new();
    loop {
        let line = match read_head_line(reader, &mut budget)? {
            Ok(Some(line)) => line,
            // the peer hung up before the blank line
            Ok(None) => return Ok(Err(Rejected::Malformed)),
            Err(rejected) => return Ok(Err(rejected)),
        };
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
            None => return Ok(Err(Rejected::Malformed)),
        }
    }

    Ok(Ok(Request {
        method: parts[0].to_string(),
        path: path.to_string(),
        headers,
        remote_addr: peer,
    }))
}

/// Reads one `\n`-terminated line of the head, charging it to `budget`.
///
/// Returns `Ok(None)` at end of input.
fn read_head_line<R: BufRead>(
    reader: &mut R,
    budget: &mut u64,
) -> io::Result<std::result::Result<Option<String>, Rejected>> {
    let mut buf = Vec::new();
    let read = reader.by_ref().take(*budget).read_until(b'\n', &mut buf)?;
    *budget = budget.saturating_sub(read as u64);

    if read == 0 {
        return Ok(if *budget == 0 {
            Err(Rejected::TooLarge)
        } else {
            Ok(None)
        });
    }
    if buf.last() != Some(&b'\n') {
        return Ok(Err(if *budget == 0 {
            Rejected::TooLarge
        } else {
            Rejected::Malformed
        }));
    }
    Ok(String::from_utf8(buf).map(Some).map_err(|_| Rejected::Malformed))
}

/// Writes `response` and closes the exchange.
fn write_response(mut stream: &TcpStream, response: &Response) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        response.status,
        status_text(response.status),
        response.content_type,
        response.body.len(),
    )?;
    stream.write_all(&response.body)?;
    stream.flush()
}

/// Reason phrase for the status codes this server emits.
fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        422 => "Unprocessable Entity",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
