use crate::{
    limits::{ConnLimits, ServerLimits},
    server::connection::{Action, Connection, Engine},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    cell::Cell,
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    rc::Rc,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    runtime,
    sync::watch,
    task::{self, LocalSet},
    time,
};
use tracing::{debug, error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Binds one listener per event loop.
///
/// With `reuse_port` every loop gets its own socket bound with
/// `SO_REUSEPORT` and the kernel balances accepts between them. Otherwise a
/// single socket is bound and cloned into every loop. The first socket fixes
/// the port, so binding port `0` works in both modes.
pub(crate) fn bind_listeners(
    addr: SocketAddr,
    limits: &ServerLimits,
) -> io::Result<(Vec<StdTcpListener>, SocketAddr)> {
    let loops = limits.event_loops.max(1);
    let reuse_port = cfg!(unix) && limits.reuse_port && loops > 1;

    let first = bind_one(addr, reuse_port, limits.backlog)?;
    let local_addr = first.local_addr()?;

    let mut listeners = Vec::with_capacity(loops);
    for _ in 1..loops {
        let next = match reuse_port {
            true => bind_one(local_addr, true, limits.backlog)?,
            false => first.try_clone()?,
        };
        listeners.push(next);
    }
    listeners.insert(0, first);

    Ok((listeners, local_addr))
}

fn bind_one(addr: SocketAddr, reuse_port: bool, backlog: i32) -> io::Result<StdTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// One OS thread running a single-threaded runtime that accepts on its own
/// listener and multiplexes every connection it accepted.
pub(crate) struct EventLoop {
    id: usize,
    listener: StdTcpListener,
    engine: Arc<Engine>,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
}

impl EventLoop {
    pub(crate) fn new(
        id: usize,
        listener: StdTcpListener,
        engine: Arc<Engine>,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> Self {
        EventLoop {
            id,
            listener,
            engine,
            shutdown,
            grace,
        }
    }

    pub(crate) fn spawn(self) -> io::Result<JoinHandle<io::Result<()>>> {
        thread::Builder::new()
            .name(format!("buff-loop-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(self) -> io::Result<()> {
        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let local = LocalSet::new();

        local.block_on(&runtime, self.accept_loop())
    }

    async fn accept_loop(self) -> io::Result<()> {
        let EventLoop {
            id,
            listener,
            engine,
            mut shutdown,
            grace,
        } = self;

        let listener = TcpListener::from_std(listener)?;
        let live = Rc::new(Cell::new(0usize));

        info!(event_loop = id, addr = %listener.local_addr()?, "event loop started");

        while !*shutdown.borrow() {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                Ok(()) = shutdown.changed() => continue,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let engine = engine.clone();
                    let shutdown = shutdown.clone();
                    let live = live.clone();

                    live.set(live.get() + 1);
                    task::spawn_local(async move {
                        serve(stream, addr, &engine, shutdown).await;
                        live.set(live.get() - 1);
                    });
                }
                Err(err) => {
                    warn!(event_loop = id, error = %err, "accept failed");
                    time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        info!(event_loop = id, live = live.get(), "event loop draining");

        let deadline = Instant::now() + grace;
        while live.get() > 0 && Instant::now() < deadline {
            time::sleep(DRAIN_POLL).await;
        }
        if live.get() > 0 {
            warn!(event_loop = id, abandoned = live.get(), "shutdown timeout elapsed");
        }

        info!(event_loop = id, "event loop stopped");
        Ok(())
    }
}

/// Drives one connection until it closes.
async fn serve(
    mut stream: TcpStream,
    addr: SocketAddr,
    engine: &Engine,
    mut shutdown: watch::Receiver<bool>,
) {
    let limits = engine.conn_limits();
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%addr, error = %err, "set_nodelay failed");
    }

    let mut conn = Connection::new(engine);
    conn.set_remote_addr(addr);
    let mut inbound = engine.buffers().acquire();
    let mut out = engine.buffers().acquire();

    debug!(%addr, "connection opened");

    loop {
        let ready = tokio::select! {
            ready = readable(&stream, limits.idle_timeout) => ready,
            Ok(()) = shutdown.changed() => {
                debug!(%addr, "closing for shutdown");
                break;
            }
        };
        match ready {
            Ok(true) => {}
            Ok(false) => {
                debug!(%addr, "idle timeout");
                break;
            }
            Err(err) => {
                error!(%addr, error = %err, "socket readiness failed");
                break;
            }
        }

        let eof = match read_batch(&stream, &mut inbound, limits) {
            Ok(eof) => eof,
            Err(err) => {
                error!(%addr, error = %err, "socket read failed");
                break;
            }
        };
        if inbound.is_empty() {
            match eof {
                true => break,
                false => continue,
            }
        }

        let action = conn.on_traffic(&inbound, engine, &mut out);
        inbound.clear();

        if !out.is_empty() {
            let written = time::timeout(limits.socket_write_timeout, stream.write_all(&out)).await;
            out.clear();

            match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(%addr, error = %err, "socket write failed");
                    break;
                }
                Err(_) => {
                    error!(%addr, "socket write timed out");
                    break;
                }
            }
        }

        if action == Action::Close || eof {
            break;
        }
    }

    debug!(%addr, served = conn.served(), "connection closed");

    conn.on_close(engine);
    engine.buffers().release(inbound);
    engine.buffers().release(out);
}

/// Waits until the socket is readable. `Ok(false)` means the idle timeout fired.
async fn readable(stream: &TcpStream, idle: Option<Duration>) -> io::Result<bool> {
    match idle {
        Some(limit) => match time::timeout(limit, stream.readable()).await {
            Ok(ready) => ready.map(|()| true),
            Err(_) => Ok(false),
        },
        None => stream.readable().await.map(|()| true),
    }
}

/// Reads until the socket would block, the per-event budget is spent, or
/// the peer closed. Returns whether the peer closed.
fn read_batch(stream: &TcpStream, inbound: &mut Vec<u8>, limits: &ConnLimits) -> io::Result<bool> {
    while inbound.len() < limits.max_read_per_event {
        inbound.reserve(limits.read_chunk);

        match stream.try_read_buf(inbound) {
            Ok(0) => return Ok(true),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod event_loop_tests {
    use super::*;

    fn limits(event_loops: usize, reuse_port: bool) -> ServerLimits {
        ServerLimits {
            event_loops,
            reuse_port,
            ..ServerLimits::default()
        }
    }

    #[test]
    fn one_listener_per_loop() {
        #[rustfmt::skip]
        let cases = [
            (1, false),
            (3, false),
            (3, cfg!(unix)),
            (0, true),
        ];

        for (loops, reuse_port) in cases {
            let addr = "127.0.0.1:0".parse().unwrap();
            let (listeners, local) = bind_listeners(addr, &limits(loops, reuse_port)).unwrap();

            assert_eq!(listeners.len(), loops.max(1));
            assert_ne!(local.port(), 0);
            for listener in &listeners {
                assert_eq!(listener.local_addr().unwrap(), local);
            }
        }
    }
}
