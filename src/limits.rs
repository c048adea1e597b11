//! Engine configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Header flooding (unbounded buffering before the header separator)
//! - Memory exhaustion through large `Content-Length` or chunked bodies
//! - Pools growing without bound under load spikes
//!
//! # Memory Consumption
//!
//! Each live connection owns one [`ConnBuffer`](crate::ConnBuffer) that grows
//! up to `max_header_bytes + max_body_size` plus whatever pipelined data the
//! client sent ahead. Response writers, contexts and output buffers are shared
//! through pools sized by [`RespLimits`].
//!
//! # Examples
//!
//! ```no_run
//! use buff_web::{Router, Server, limits::{ConnLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! let mut router = Router::new();
//! router.get("/", |_: &buff_web::Request, ctx: &mut buff_web::Context| {
//!     ctx.response().write("Hello world!");
//! }).unwrap();
//!
//! let server = Server::builder()
//!     .bind("127.0.0.1:8080")
//!     .router(router)
//!     .server_limits(ServerLimits {
//!         event_loops: 2,
//!         ..ServerLimits::default()
//!     })
//!     .connection_limits(ConnLimits {
//!         max_body_size: 16 * 1024,
//!         idle_timeout: Some(Duration::from_secs(30)),
//!         ..ConnLimits::default()
//!     })
//!     .build()
//!     .unwrap();
//!
//! server.launch().unwrap();
//! ```

use std::time::Duration;

/// Controls the event loops and listener sockets.
///
/// # Event loops
/// ```text
///           [ loop 0 ]   [ loop 1 ]  ...  [ loop N-1 ]
///               ||           ||                ||
///           accept()     accept()          accept()
///               ||           ||                ||
///   [ conn ][ conn ]..   [ conn ]..        [ conn ]..
/// ```
///
/// Each loop is an OS thread driving its own single-threaded runtime. A loop
/// serves every connection it accepted, one callback at a time, so a blocking
/// handler stalls every connection of that loop.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of independent event loops (default: available parallelism).
    pub event_loops: usize,

    /// Gives every loop its own listener bound with `SO_REUSEPORT` (default: `true` on unix).
    ///
    /// When `false`, or on platforms without `SO_REUSEPORT`, one listener is
    /// created and cloned into every loop.
    pub reuse_port: bool,

    /// Listen backlog passed to `listen(2)` (default: `1024`).
    pub backlog: i32,

    /// Value of the `Server` header added to responses that lack one
    /// (default: `Some("buff_web")`). `None` omits the header.
    pub server_header: Option<String>,

    /// Format for error responses (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the engine will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// Server: buff_web\r
    /// Date: Sun, 18 Oct 2026 12:00:00 GMT\r
    /// Connection: close\r
    /// Content-Type: application/json\r
    /// Content-Length: 57\r
    /// \r
    /// {"error":"Invalid header format","code":"INVALID_HEADER"}
    /// ```
    /// If `false`, then on error the engine will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// Server: buff_web\r
    /// Date: Sun, 18 Oct 2026 12:00:00 GMT\r
    /// Connection: close\r
    /// Content-Length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    /// How long a graceful shutdown waits for live connections (default: `5 seconds`).
    pub shutdown_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            event_loops: std::thread::available_parallelism().map_or(1, |n| n.get()),
            reuse_port: cfg!(unix),
            backlog: 1024,
            server_header: Some("buff_web".to_owned()),
            json_errors: true,
            shutdown_timeout: Duration::from_secs(5),

            _priv: (),
        }
    }
}

/// Connection-level limits and timeouts
///
/// Controls how much a single connection may buffer and how long the engine
/// waits on it.
///
/// Default values balance performance, resource usage, and security.
/// Only change if you understand the consequences.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum size of the header section, request line included (default: `8 KiB`)
    ///
    /// Exceeding it yields `431 Request Header Fields Too Large` and the
    /// connection is closed.
    pub max_header_bytes: usize,

    /// Maximum request body size, declared or decoded (default: `1 MiB`)
    ///
    /// A larger `Content-Length`, or a chunked body that decodes past it,
    /// yields `413` and the connection is closed.
    pub max_body_size: usize,

    /// Size of a single socket read (default: `4 KiB`)
    pub read_chunk: usize,

    /// Upper bound of bytes appended to the buffer per readiness event (default: `64 KiB`)
    ///
    /// Once reached, the buffered data is processed before reading further,
    /// so one fast client cannot monopolize its loop.
    pub max_read_per_event: usize,

    /// Maximum duration to wait for writing data to socket (default: `3 seconds`)
    ///
    /// If data can't be written in time, connection is terminated.
    pub socket_write_timeout: Duration,

    /// Closes a connection after this long without inbound data (default: `None`)
    pub idle_timeout: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_header_bytes: 8 * 1024,
            max_body_size: 1024 * 1024,
            read_chunk: 4 * 1024,
            max_read_per_event: 64 * 1024,
            socket_write_timeout: Duration::from_secs(3),
            idle_timeout: None,

            _priv: (),
        }
    }
}

/// Configuration for response processing and object pooling.
///
/// # Buffer Management
///
/// Pooled objects are handled as follows on release:
/// ```rust
/// # use buff_web::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut pool: Vec<Vec<u8>> = Vec::new();
/// # let buffer: Vec<u8> = Vec::with_capacity(limits.default_capacity);
/// if buffer.capacity() <= limits.max_capacity && pool.len() < limits.pool_size {
///     pool.push(buffer);
/// } // else: dropped
/// ```
///
/// Acquiring from an empty pool creates a new object with `default_capacity`.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of response body and output buffers (default: `1024 B`)
    pub default_capacity: usize,
    /// Largest buffer capacity returned to a pool (default: `64 KiB`)
    pub max_capacity: usize,
    /// Maximum number of idle objects kept per pool (default: `1024`)
    pub pool_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 64 * 1024,
            pool_size: 1024,

            _priv: (),
        }
    }
}
