use crate::{
    errors::ServerError,
    limits::{ConnLimits, RespLimits, ServerLimits},
    server::{
        connection::Engine,
        event_loop::{self, EventLoop},
    },
    Router,
};
use std::{
    fmt, io,
    net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs},
    sync::Arc,
    thread::JoinHandle,
};
use tokio::sync::watch;
use tracing::{error, info};

/// An HTTP/1.1 server running one or more event loops over a shared router.
///
/// [`build`](ServerBuilder::build) binds the listeners right away, so
/// [`local_addr`](Self::local_addr) is known before the server runs.
/// [`launch`](Self::launch) blocks the calling thread until every event loop
/// has stopped.
///
/// # Examples
///
/// ```no_run
/// use buff_web::{Context, Request, Router, Server};
/// use std::thread;
///
/// let mut router = Router::new();
/// router.get("/", |_: &Request, ctx: &mut Context| {
///     ctx.response().write("Hello world!");
/// }).unwrap();
///
/// let server = Server::builder()
///     .bind("127.0.0.1:8080")
///     .router(router)
///     .build()
///     .unwrap();
///
/// let handle = server.handle();
/// let running = thread::spawn(move || server.launch());
///
/// // ...
/// handle.shutdown();
/// running.join().unwrap().unwrap();
/// ```
pub struct Server {
    listeners: Vec<StdTcpListener>,
    local_addr: SocketAddr,
    engine: Arc<Engine>,
    server_limits: ServerLimits,
    shutdown: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("event_loops", &self.listeners.len())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Address the listeners are bound to.
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server from another thread.
    #[inline]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the event loops and blocks until all of them have stopped.
    ///
    /// Returns the first error reported by a loop, if any.
    pub fn launch(self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            event_loops = self.listeners.len(),
            "server started"
        );

        let grace = self.server_limits.shutdown_timeout;
        let mut loops: Vec<JoinHandle<io::Result<()>>> = Vec::with_capacity(self.listeners.len());
        let mut result = Ok(());

        for (id, listener) in self.listeners.into_iter().enumerate() {
            let event_loop = EventLoop::new(
                id,
                listener,
                self.engine.clone(),
                self.shutdown.subscribe(),
                grace,
            );

            match event_loop.spawn() {
                Ok(handle) => loops.push(handle),
                Err(err) => {
                    error!(event_loop = id, error = %err, "failed to spawn event loop");
                    self.shutdown.send_replace(true);
                    result = Err(err);
                    break;
                }
            }
        }

        for handle in loops {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(io::Error::new(io::ErrorKind::Other, "event loop panicked")),
            };
            if let Err(err) = outcome {
                error!(error = %err, "event loop failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        info!("server stopped");
        result
    }
}

/// Stops a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    /// Starts a graceful shutdown.
    ///
    /// Every loop stops accepting, idle connections close, busy ones finish
    /// their current cycle. After [`ServerLimits::shutdown_timeout`] the
    /// remaining connections are dropped and [`Server::launch`] returns.
    /// Calling it before `launch` makes `launch` return right away.
    #[inline]
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.send_replace(true);
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
#[derive(Default)]
pub struct ServerBuilder {
    addr: Option<io::Result<SocketAddr>>,
    router: Option<Router>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    response_limits: Option<RespLimits>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("addr", &self.addr)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    /// Sets the address to listen on; the first resolved address is used.
    ///
    /// **This is a required component.**
    #[inline]
    pub fn bind<A: ToSocketAddrs>(mut self, addr: A) -> Self {
        let resolved = addr.to_socket_addrs().and_then(|mut addrs| {
            addrs.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
            })
        });
        self.addr = Some(resolved);
        self
    }

    /// Sets the router serving every request.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Configures event loops, listeners and error responses.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use buff_web::{Router, Server, limits::ServerLimits};
    ///
    /// let server = Server::builder()
    ///     .bind("127.0.0.1:8080")
    ///     .router(Router::new())
    ///     .server_limits(ServerLimits {
    ///         event_loops: 4,
    ///         server_header: None,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection buffering limits and timeouts.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use buff_web::{Router, Server, limits::ConnLimits};
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .bind("127.0.0.1:8080")
    ///     .router(Router::new())
    ///     .connection_limits(ConnLimits {
    ///         max_body_size: 64 * 1024,
    ///         socket_write_timeout: Duration::from_secs(2),
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures buffer capacities and pool sizes.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use buff_web::{Router, Server, limits::RespLimits};
    ///
    /// let server = Server::builder()
    ///     .bind("127.0.0.1:8080")
    ///     .router(Router::new())
    ///     .response_limits(RespLimits {
    ///         default_capacity: 4096,
    ///         max_capacity: 16 * 1024,
    ///         ..RespLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Verifies the router and binds the listeners.
    ///
    /// # Errors
    ///
    /// - [`ServerError::MissingRouter`] / [`ServerError::MissingAddress`]
    ///   when a required component was not set
    /// - [`ServerError::Route`] when the router fails [`Router::verify`]
    /// - [`ServerError::Io`] when the address does not resolve or cannot be bound
    pub fn build(self) -> Result<Server, ServerError> {
        let router = self.router.ok_or(ServerError::MissingRouter)?;
        let addr = self.addr.ok_or(ServerError::MissingAddress)??;
        router.verify()?;

        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();
        let resp_limits = self.response_limits.unwrap_or_default();

        let (listeners, local_addr) = event_loop::bind_listeners(addr, &server_limits)?;
        let engine = Engine::new(Arc::new(router), &server_limits, &conn_limits, &resp_limits);
        let (shutdown, _) = watch::channel(false);

        Ok(Server {
            listeners,
            local_addr,
            engine: Arc::new(engine),
            server_limits,
            shutdown: Arc::new(shutdown),
        })
    }
}

#[cfg(test)]
mod server_tests {
    use super::*;

    #[test]
    fn build_errors() {
        assert!(matches!(
            Server::builder().bind("127.0.0.1:0").build(),
            Err(ServerError::MissingRouter)
        ));
        assert!(matches!(
            Server::builder().router(Router::new()).build(),
            Err(ServerError::MissingAddress)
        ));
        assert!(matches!(
            Server::builder().bind("not an address").router(Router::new()).build(),
            Err(ServerError::Io(_))
        ));
    }

    #[test]
    fn shutdown_before_launch() {
        let server = Server::builder()
            .bind("127.0.0.1:0")
            .router(Router::new())
            .server_limits(ServerLimits {
                event_loops: 2,
                ..ServerLimits::default()
            })
            .build()
            .unwrap();

        assert_ne!(server.local_addr().port(), 0);

        server.handle().shutdown();
        server.launch().unwrap();
    }
}
