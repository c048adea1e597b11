use crate::{
    errors::ErrorKind,
    http::{
        request::{ParseStatus, Request},
        response::ResponseWriter,
    },
    limits::{ConnLimits, RespLimits, ServerLimits},
    pool::{Pool, Reusable},
    Context, Router, StatusCode,
};
use std::{
    any::Any,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error, warn};

const INTERNAL_ERROR: &str = "{\"error\":\"internal error\"}\n";

/// Inbound bytes of one connection not consumed by the parser yet.
///
/// Appends go to the tail, completed requests are discarded from the head so
/// that pipelined bytes stay in place for the next parse.
#[derive(Debug, Default)]
pub struct ConnBuffer {
    data: Vec<u8>,
}

impl ConnBuffer {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn from_vec(mut data: Vec<u8>) -> Self {
        data.clear();
        ConnBuffer { data }
    }

    #[inline]
    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.data
    }

    #[inline(always)]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drops the first `n` bytes, keeping the rest in order.
    #[inline]
    pub fn discard(&mut self, n: usize) {
        if n >= self.data.len() {
            self.data.clear();
            return;
        }
        self.data.copy_within(n.., 0);
        self.data.truncate(self.data.len() - n);
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.data.clear();
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Where a connection is in its request cycle.
///
/// ```text
/// Open -> Accumulating <-> Parsing -> Dispatching -> Responding -> Parsing ...
///                             |                          |
///                             +--------> Closing <-------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Accumulating,
    Parsing,
    Dispatching,
    Responding,
    Closing,
}

/// What the event loop must do after a traffic callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Flush the output and wait for more bytes.
    Continue,
    /// Flush the output, then close the connection.
    Close,
}

/// Shared per-server state used by every connection: the router, the limits
/// and the object pools.
pub struct Engine {
    router: Arc<Router>,
    conn_limits: ConnLimits,
    server_header: Option<String>,
    json_errors: bool,

    writers: Pool<ResponseWriter>,
    contexts: Pool<Context>,
    buffers: Pool<Vec<u8>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("writers", &self.writers)
            .field("contexts", &self.contexts)
            .field("buffers", &self.buffers)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        router: Arc<Router>,
        server_limits: &ServerLimits,
        conn_limits: &ConnLimits,
        resp_limits: &RespLimits,
    ) -> Self {
        Engine {
            router,
            conn_limits: conn_limits.clone(),
            server_header: server_limits.server_header.clone(),
            json_errors: server_limits.json_errors,

            writers: Pool::new(resp_limits),
            contexts: Pool::new(resp_limits),
            buffers: Pool::new(resp_limits),
        }
    }

    #[inline(always)]
    pub fn router(&self) -> &Router {
        &self.router
    }

    #[inline(always)]
    pub fn conn_limits(&self) -> &ConnLimits {
        &self.conn_limits
    }

    #[inline(always)]
    pub(crate) fn buffers(&self) -> &Pool<Vec<u8>> {
        &self.buffers
    }

    /// Runs the router for `req` and appends the finalized response to `out`.
    /// Returns whether the connection must close.
    ///
    /// A panicking handler is turned into `500 {"error":"internal error"}`.
    pub(crate) fn serve(&self, req: &Request, close_after: bool, out: &mut Vec<u8>) -> bool {
        let mut ctx = self.contexts.acquire();
        ctx.attach(self.writers.acquire());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.router.dispatch(req, &mut ctx)));

        let mut writer = ctx.detach();
        if let Err(payload) = outcome {
            error!(
                method = req.method(),
                path = req.path(),
                panic = panic_message(payload.as_ref()),
                "handler panicked"
            );
            Reusable::reset(&mut writer);
            writer.json(StatusCode::InternalServerError, INTERNAL_ERROR);
        }

        let close = writer.finalize(req, close_after, self.server_header.as_deref(), out);

        self.writers.release(writer);
        self.contexts.release(ctx);
        close
    }

    /// Appends the canned response for a protocol error.
    #[inline]
    pub(crate) fn reject(&self, kind: ErrorKind, out: &mut Vec<u8>) {
        kind.write_response(self.json_errors, self.server_header.as_deref(), out);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Transport-independent state of one connection.
///
/// The event loop feeds every batch of inbound bytes to
/// [`on_traffic`](Self::on_traffic), writes whatever it appended to `out`
/// and acts on the returned [`Action`]. Pipelined requests are answered in
/// arrival order within one call.
///
/// # Examples
/// ```
/// use buff_web::{
///     limits::{ConnLimits, RespLimits, ServerLimits},
///     Action, Connection, Context, Engine, Request, Router,
/// };
/// use std::sync::Arc;
///
/// let mut router = Router::new();
/// router.get("/ping", |_: &Request, ctx: &mut Context| {
///     ctx.response().write("pong");
/// }).unwrap();
///
/// let engine = Engine::new(
///     Arc::new(router),
///     &ServerLimits::default(),
///     &ConnLimits::default(),
///     &RespLimits::default(),
/// );
/// let mut conn = Connection::new(&engine);
/// let mut out = Vec::new();
///
/// let action = conn.on_traffic(b"GET /ping HTTP/1.1\r\nHost: a\r\n\r\n", &engine, &mut out);
///
/// assert_eq!(action, Action::Continue);
/// assert!(out.ends_with(b"\r\n\r\npong"));
/// conn.on_close(&engine);
/// ```
#[derive(Debug)]
pub struct Connection {
    buffer: ConnBuffer,
    request: Request,
    state: ConnState,
    served: usize,
}

impl Connection {
    pub fn new(engine: &Engine) -> Self {
        Connection {
            buffer: ConnBuffer::from_vec(engine.buffers.acquire()),
            request: Request::new(),
            state: ConnState::Open,
            served: 0,
        }
    }

    #[inline]
    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.request.remote_addr = Some(addr);
    }

    #[inline(always)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Requests answered so far.
    #[inline(always)]
    pub fn served(&self) -> usize {
        self.served
    }

    /// Bytes buffered but not yet consumed by a complete request.
    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Handles one batch of inbound bytes.
    ///
    /// Every complete request in the buffer is parsed, dispatched and
    /// finalized into `out`. Processing stops at the first incomplete request,
    /// at a response that closes the connection, or at a protocol error, which
    /// is answered with its canned response before closing.
    pub fn on_traffic(&mut self, inbound: &[u8], engine: &Engine, out: &mut Vec<u8>) -> Action {
        if self.state == ConnState::Closing {
            return Action::Close;
        }
        self.buffer.append(inbound);

        loop {
            self.state = ConnState::Parsing;

            match self.request.parse(self.buffer.as_slice(), &engine.conn_limits) {
                Ok(ParseStatus::NeedMoreData) => {
                    self.state = ConnState::Accumulating;
                    return Action::Continue;
                }
                Ok(ParseStatus::Complete {
                    consumed,
                    close_after,
                }) => {
                    self.state = ConnState::Dispatching;
                    let close = engine.serve(&self.request, close_after, out);

                    self.state = ConnState::Responding;
                    self.buffer.discard(consumed);
                    self.served += 1;

                    if close {
                        debug!(served = self.served, "closing after response");
                        self.state = ConnState::Closing;
                        return Action::Close;
                    }
                    if self.buffer.is_empty() {
                        self.state = ConnState::Accumulating;
                        return Action::Continue;
                    }
                }
                Err(kind) => {
                    warn!(error = %kind, buffered = self.buffer.len(), "rejecting request");
                    engine.reject(kind, out);
                    self.state = ConnState::Closing;
                    return Action::Close;
                }
            }
        }
    }

    /// Releases pooled resources. Called once, when the socket is gone.
    pub fn on_close(self, engine: &Engine) {
        engine.buffers.release(self.buffer.into_vec());
    }
}

#[cfg(test)]
mod connection_tests {
    use super::*;
    use crate::tools::str_op;

    fn engine(conn_limits: ConnLimits) -> Engine {
        let mut router = Router::new();
        router
            .get("/hello", |_: &Request, ctx: &mut Context| {
                ctx.response().write("hi");
            })
            .unwrap();
        router
            .post("/echo", |req: &Request, ctx: &mut Context| {
                let body = req.body().to_vec();
                ctx.response().write(body);
            })
            .unwrap();
        router
            .get("/users/:id", |_: &Request, ctx: &mut Context| {
                let id = ctx.param("id").unwrap_or_default().to_owned();
                ctx.response().write(id);
            })
            .unwrap();
        router
            .get("/panic", |_: &Request, _: &mut Context| panic!("boom"))
            .unwrap();
        router
            .get("/bye", |_: &Request, ctx: &mut Context| {
                ctx.response().set_header("Connection", "close").write("bye");
            })
            .unwrap();

        let server_limits = ServerLimits {
            server_header: None,
            ..ServerLimits::default()
        };
        Engine::new(Arc::new(router), &server_limits, &conn_limits, &RespLimits::default())
    }

    fn status_lines(out: &[u8]) -> Vec<&str> {
        let text = str_op(out);
        text.match_indices("HTTP/1.1 ")
            .filter_map(|(at, _)| text[at..].split("\r\n").next())
            .collect()
    }

    #[test]
    fn pipelined_in_order() {
        let engine = engine(ConnLimits::default());
        let mut conn = Connection::new(&engine);
        let mut out = Vec::new();

        let src = "GET /hello HTTP/1.1\r\nHost: a\r\n\r\n\
                   POST /echo HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc\
                   GET /users/42 HTTP/1.1\r\nHost: a\r\n\r\n";

        assert_eq!(conn.on_traffic(src.as_bytes(), &engine, &mut out), Action::Continue);
        assert_eq!(conn.served(), 3);
        assert_eq!(conn.buffered(), 0);
        assert_eq!(conn.state(), ConnState::Accumulating);

        let text = str_op(&out);
        let hi = text.find("\r\n\r\nhi").unwrap();
        let abc = text.find("\r\n\r\nabc").unwrap();
        let id = text.find("\r\n\r\n42").unwrap();
        assert!(hi < abc && abc < id);
        assert_eq!(status_lines(&out), ["HTTP/1.1 200 OK"; 3]);

        conn.on_close(&engine);
        assert_eq!(engine.buffers().len(), 1);
    }

    #[test]
    fn incremental_feed() {
        let engine = engine(ConnLimits::default());
        let mut conn = Connection::new(&engine);
        let mut out = Vec::new();

        let src = b"POST /echo HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
                    3\r\nabc\r\n2\r\nde\r\n0\r\n\r\nGET /hel";

        for byte in src.chunks(1) {
            assert_eq!(conn.on_traffic(byte, &engine, &mut out), Action::Continue);
        }
        assert_eq!(conn.served(), 1);
        assert_eq!(conn.buffered(), 8);
        assert!(str_op(&out).ends_with("\r\n\r\nabcde"));

        out.clear();
        conn.on_traffic(b"lo HTTP/1.1\r\nHost: a\r\n\r\n", &engine, &mut out);
        assert_eq!(conn.served(), 2);
        assert!(str_op(&out).ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn large_chunked_body_in_slices() {
        let engine = engine(ConnLimits::default());
        let mut conn = Connection::new(&engine);
        let mut out = Vec::new();

        let mut wire = b"POST /echo HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for _ in 0..125_000 {
            wire.extend_from_slice(b"8\r\n01234567\r\n");
        }
        wire.extend_from_slice(b"0\r\n\r\n");

        for slice in wire.chunks(4096) {
            assert_eq!(conn.on_traffic(slice, &engine, &mut out), Action::Continue);
        }

        assert_eq!(conn.served(), 1);
        assert_eq!(conn.buffered(), 0);
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with(&b"01234567".repeat(125_000)));
        assert!(str_op(&out[..256]).contains("\r\nContent-Length: 1000000\r\n"));
    }

    #[test]
    fn routing_errors_keep_connection() {
        let engine = engine(ConnLimits::default());
        let mut conn = Connection::new(&engine);
        let mut out = Vec::new();

        let src = "GET /nope HTTP/1.1\r\n\r\nDELETE /hello HTTP/1.1\r\n\r\nGET /panic HTTP/1.1\r\n\r\n";
        assert_eq!(conn.on_traffic(src.as_bytes(), &engine, &mut out), Action::Continue);

        assert_eq!(
            status_lines(&out),
            [
                "HTTP/1.1 404 Not Found",
                "HTTP/1.1 405 Method Not Allowed",
                "HTTP/1.1 500 Internal Server Error",
            ]
        );
        let text = str_op(&out);
        assert!(text.contains("{\"error\":\"route not found\"}\n"));
        assert!(text.contains("{\"error\":\"method not allowed\"}\n"));
        assert!(text.ends_with(INTERNAL_ERROR));
    }

    #[test]
    fn close_stops_pipeline() {
        #[rustfmt::skip]
        let cases = [
            ("GET /bye HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n", 1),
            ("GET /hello HTTP/1.1\r\nConnection: close\r\n\r\nGET /hello HTTP/1.1\r\n\r\n", 1),
            ("GET /hello HTTP/1.0\r\n\r\nGET /hello HTTP/1.1\r\n\r\n", 1),
        ];

        for (src, served) in cases {
            let engine = engine(ConnLimits::default());
            let mut conn = Connection::new(&engine);
            let mut out = Vec::new();

            assert_eq!(conn.on_traffic(src.as_bytes(), &engine, &mut out), Action::Close, "{src:?}");
            assert_eq!(conn.served(), served, "{src:?}");
            assert_eq!(conn.state(), ConnState::Closing);
            assert_eq!(status_lines(&out).len(), served, "{src:?}");
            assert!(str_op(&out).contains("\r\nConnection: close\r\n"), "{src:?}");

            assert_eq!(conn.on_traffic(b"GET /hello HTTP/1.1\r\n\r\n", &engine, &mut Vec::new()), Action::Close);
        }
    }

    #[test]
    fn http10_keep_alive() {
        let engine = engine(ConnLimits::default());
        let mut conn = Connection::new(&engine);
        let mut out = Vec::new();

        let src = "GET /hello HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        assert_eq!(conn.on_traffic(src.as_bytes(), &engine, &mut out), Action::Continue);
        assert!(str_op(&out).contains("\r\nConnection: keep-alive\r\n"));
    }

    #[test]
    fn protocol_errors() {
        #[rustfmt::skip]
        let cases = [
            ("GET /hello HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n",
                "HTTP/1.1 431 Request Header Fields Too Large"),
            ("GET /hello HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "HTTP/1.1 431 Request Header Fields Too Large"),
            ("GET /hello HTTP/2.0\r\n\r\n",
                "HTTP/1.1 400 Bad Request"),
            ("GET /hello HTTP/1.1\r\nbroken\r\n\r\n",
                "HTTP/1.1 400 Bad Request"),
            ("POST /echo HTTP/1.1\r\nContent-Length: 100\r\n\r\n",
                "HTTP/1.1 413 Request Entity Too Large"),
        ];

        let limits = ConnLimits {
            max_header_bytes: 48,
            max_body_size: 16,
            ..ConnLimits::default()
        };

        for (src, status) in cases {
            let engine = engine(limits.clone());
            let mut conn = Connection::new(&engine);
            let mut out = Vec::new();

            assert_eq!(conn.on_traffic(src.as_bytes(), &engine, &mut out), Action::Close, "{src:?}");
            assert_eq!(status_lines(&out), [status], "{src:?}");
            assert!(str_op(&out).contains("\r\nConnection: close\r\n"));
            assert_eq!(conn.served(), 0);
        }
    }

    #[test]
    fn error_after_valid_request() {
        let engine = engine(ConnLimits::default());
        let mut conn = Connection::new(&engine);
        let mut out = Vec::new();

        let src = "GET /hello HTTP/1.1\r\n\r\nGET\r\n\r\n";
        assert_eq!(conn.on_traffic(src.as_bytes(), &engine, &mut out), Action::Close);
        assert_eq!(
            status_lines(&out),
            ["HTTP/1.1 200 OK", "HTTP/1.1 400 Bad Request"]
        );
    }

    #[test]
    fn conn_buffer_discard() {
        let mut buf = ConnBuffer::new();
        buf.append(b"hello world");

        buf.discard(6);
        assert_eq!(buf.as_slice(), b"world");
        buf.discard(10);
        assert!(buf.is_empty());

        buf.append(b"x");
        buf.reset();
        assert_eq!(buf.len(), 0);
    }
}
