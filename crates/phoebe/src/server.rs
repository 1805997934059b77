//! TLS accept loops and the multi-protocol dispatcher.
//!
//! One listener per port; every accepted connection gets its own thread.
//! The first CRLF-terminated line decides the protocol (Gemini, Titan, or
//! HTTP) and everything else is synchronous I/O on the rustls stream.

#![allow(missing_docs)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use rustls::{ServerConnection, StreamOwned};
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use crate::changes::contributor_code;
use crate::config::Config;
use crate::error::ServerError;
use crate::ext::Registry;
use crate::request::{self, RequestLine};
use crate::store::Store;
use crate::{gemini, http, titan, tls};

/// Request lines longer than this are rejected with status 59.
pub const REQUEST_LINE_LIMIT: usize = 1024;

/// Hard timeout for reading the request line.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for reading a Titan upload body.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period for in-flight handlers during shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A Gemini-shaped response, reused by Titan and translated for HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub meta: String,
    pub body: Vec<u8>,
}

impl Response {
    #[must_use]
    pub fn success(mime: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 20,
            meta: mime.to_string(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn gemtext(body: String) -> Self {
        Self::success("text/gemini; charset=UTF-8", body.into_bytes())
    }

    #[must_use]
    pub fn plain(body: String) -> Self {
        Self::success("text/plain; charset=UTF-8", body.into_bytes())
    }

    #[must_use]
    pub fn html(body: String) -> Self {
        Self::success("text/html; charset=UTF-8", body.into_bytes())
    }

    /// Status 10: ask the client for input.
    #[must_use]
    pub fn input(prompt: &str) -> Self {
        Self {
            status: 10,
            meta: prompt.to_string(),
            body: Vec::new(),
        }
    }

    /// Status 30: redirect to `url`.
    #[must_use]
    pub fn redirect(url: &str) -> Self {
        Self {
            status: 30,
            meta: url.to_string(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_error(err: &ServerError) -> Self {
        let (status, meta) = err.status();
        Self {
            status,
            meta,
            body: Vec::new(),
        }
    }

    /// Write the response in Gemini framing; bodies only on 2x.
    pub fn write_gemini<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write!(writer, "{} {}\r\n", self.status, self.meta)?;
        if (20..30).contains(&self.status) {
            writer.write_all(&self.body)?;
        }
        writer.flush()
    }
}

/// Everything a handler needs, captured at accept time.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
}

/// One configuration generation: handler context plus TLS material.
pub struct ServerState {
    pub context: Context,
    pub tls: Arc<rustls::ServerConfig>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ServerState {
    /// Assemble a state from a finished configuration and registry.
    pub fn build(config: Config, registry: Registry) -> Result<Self, ServerError> {
        let tls = tls::server_config(&config, registry.wants_client_certs())?;
        let store = Arc::new(Store::new(config.wiki_dir.clone()));
        Ok(Self {
            context: Context {
                config: Arc::new(config),
                store,
                registry: Arc::new(registry),
            },
            tls,
        })
    }
}

/// The running server: swappable state, shutdown flag, worker accounting.
pub struct Server {
    state: RwLock<Arc<ServerState>>,
    shutdown: AtomicBool,
    active: AtomicUsize,
}

impl Server {
    #[must_use]
    pub fn new(state: ServerState) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(Arc::new(state)),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        })
    }

    /// Current state; connections keep the generation they started with.
    #[must_use]
    pub fn state(&self) -> Arc<ServerState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a freshly built state (hangup reload).
    pub fn swap_state(&self, state: ServerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
        info!("configuration reloaded");
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Accept connections until shutdown is requested.
    ///
    /// The caller owns the listener thread; a loopback connect is enough to
    /// wake the loop after flipping the shutdown flag.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) {
        let local = listener.local_addr().ok();
        info!(addr = ?local, "listening");
        for stream in listener.incoming() {
            if self.is_shutting_down() {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            let server = self.clone();
            let state = self.state();
            server.active.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                let _guard = WorkerGuard(&server.active);
                handle_connection(&state, stream);
            });
        }
        info!(addr = ?local, "accept loop stopped");
    }

    /// Wait up to [`DRAIN_TIMEOUT`] for in-flight handlers to finish.
    pub fn drain(&self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
    }
}

struct WorkerGuard<'a>(&'a AtomicUsize);

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn handle_connection(state: &ServerState, stream: TcpStream) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(_) => return,
    };
    if stream.set_read_timeout(Some(REQUEST_TIMEOUT)).is_err() {
        return;
    }
    let connection = match ServerConnection::new(state.tls.clone()) {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%peer, "tls setup failed: {err}");
            return;
        }
    };
    let tls_stream = StreamOwned::new(connection, stream);
    let mut reader = BufReader::new(tls_stream);

    let line = match read_request_line(&mut reader) {
        Ok(line) => line,
        Err(ServerError::RequestTooLong) => {
            let _ = Response::from_error(&ServerError::RequestTooLong)
                .write_gemini(reader.get_mut());
            close(reader);
            return;
        }
        Err(_) => {
            // Idle or broken connections are dropped without a response.
            return;
        }
    };
    info!(%peer, line, "request");

    let response = dispatch(state, &line, &peer, &mut reader);
    if let Some(response) = response {
        if let Err(err) = response.write_gemini(reader.get_mut()) {
            debug!(%peer, "response write failed: {err}");
        }
    }
    close(reader);
}

/// Route one classified request line; `None` means the handler already
/// wrote its own framing (HTTP does).
fn dispatch(
    state: &ServerState,
    line: &str,
    peer: &SocketAddr,
    reader: &mut BufReader<StreamOwned<ServerConnection, TcpStream>>,
) -> Option<Response> {
    let ctx = &state.context;
    let code = contributor_code(&peer.ip());
    match request::classify(line) {
        RequestLine::Gemini => {
            let mut req = match request::parse_gemini(line, &ctx.config) {
                Ok(req) => req,
                Err(err) => return Some(Response::from_error(&err)),
            };
            req.code = code;
            req.fingerprint = peer_fingerprint(reader);
            if let Some(response) = ctx.registry.handle(&req) {
                return Some(response);
            }
            Some(gemini::respond(&req, ctx))
        }
        RequestLine::Titan => {
            let mut req = match request::parse_titan(line, &ctx.config) {
                Ok(req) => req,
                Err(err) => return Some(Response::from_error(&err)),
            };
            req.code = code;
            req.fingerprint = peer_fingerprint(reader);
            if let Some(response) = ctx.registry.handle(&req) {
                return Some(response);
            }
            let _ = reader
                .get_ref()
                .sock
                .set_read_timeout(Some(UPLOAD_TIMEOUT));
            Some(titan::handle(&req, reader, ctx))
        }
        RequestLine::Http { method, target } => {
            let headers = match read_http_headers(reader) {
                Ok(headers) => headers,
                Err(_) => return None,
            };
            let host = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("host"))
                .map(|(_, value)| value.as_str());
            let head_only = method == "HEAD";
            match request::resolve_http(&method, &target, host, &ctx.config) {
                Ok(mut req) => {
                    req.code = code;
                    req.fingerprint = peer_fingerprint(reader);
                    if let Some(response) = ctx.registry.handle(&req) {
                        let _ = http::write_response(reader.get_mut(), &response, head_only);
                    } else {
                        let _ = http::handle(reader.get_mut(), &req, ctx);
                    }
                }
                Err(err) => {
                    let _ = http::write_response(
                        reader.get_mut(),
                        &Response::from_error(&err),
                        head_only,
                    );
                }
            }
            None
        }
        RequestLine::Invalid => Some(Response::from_error(&ServerError::MalformedRequest(
            SmolStr::new("unknown scheme"),
        ))),
    }
}

fn peer_fingerprint(
    reader: &BufReader<StreamOwned<ServerConnection, TcpStream>>,
) -> Option<String> {
    reader
        .get_ref()
        .conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| tls::fingerprint(cert.as_ref()))
}

fn close(mut reader: BufReader<StreamOwned<ServerConnection, TcpStream>>) {
    let stream = reader.get_mut();
    stream.conn.send_close_notify();
    let _ = stream.conn.complete_io(&mut stream.sock);
}

/// Read one CRLF-terminated line of at most [`REQUEST_LINE_LIMIT`] bytes.
pub fn read_request_line<R: BufRead>(reader: &mut R) -> Result<String, ServerError> {
    let mut buf = Vec::with_capacity(128);
    loop {
        let available = reader
            .fill_buf()
            .map_err(|err| ServerError::Store(SmolStr::new(err.to_string())))?;
        if available.is_empty() {
            return Err(ServerError::MalformedRequest("connection closed".into()));
        }
        if let Some(at) = available.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..at]);
            reader.consume(at + 1);
            break;
        }
        buf.extend_from_slice(available);
        let len = available.len();
        reader.consume(len);
        if buf.len() > REQUEST_LINE_LIMIT {
            return Err(ServerError::RequestTooLong);
        }
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > REQUEST_LINE_LIMIT {
        return Err(ServerError::RequestTooLong);
    }
    String::from_utf8(buf)
        .map_err(|_| ServerError::MalformedRequest("request line is not valid UTF-8".into()))
}

/// Read `\r\n`-terminated header lines until the empty line.
fn read_http_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>, ServerError> {
    let mut headers = Vec::new();
    loop {
        let line = read_request_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        if headers.len() > 64 {
            return Err(ServerError::MalformedRequest("too many headers".into()));
        }
    }
}
