//! buff_web - Event-loop driven HTTP/1.1 engine with a trie router
//!
//! A small HTTP/1.1 server core: an incremental request parser that never
//! blocks, a per-connection buffer state machine answering pipelined requests
//! in order, a method + path router and pooled per-request objects.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked request bodies with trailers
//! - **HTTP/1.0**: closes after each response unless `Connection: keep-alive` is sent
//! - Not supported: HTTP/2, TLS, WebSocket upgrades, compression
//!
//! # Architecture
//!
//! ```text
//!  socket bytes --> ConnBuffer --> Request::parse --> Router::dispatch --> ResponseWriter::finalize
//!                       ^              |                (handlers +             |
//!                       +-- NeedMore --+                 middleware)            v
//!                                                                         output buffer
//! ```
//!
//! - Every event loop is an OS thread with its own single-threaded runtime;
//!   callbacks of one loop never run in parallel.
//! - Handlers run inline on the loop: they must not block.
//! - A panicking handler produces `500` and the connection keeps serving.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use buff_web::{Context, Request, Router, Server};
//!
//! let mut router = Router::new();
//! router.get("/", |_: &Request, ctx: &mut Context| {
//!     ctx.response().write("Hello World!");
//! }).unwrap();
//!
//! Server::builder()
//!     .bind("127.0.0.1:8080")
//!     .router(router)
//!     .build()
//!     .unwrap()
//!     .launch()
//!     .unwrap();
//! ```
//! Parameters, groups and middleware:
//! ```no_run
//! use buff_web::{timeout, Context, Request, Router, Server, StatusCode};
//! use std::time::Duration;
//!
//! let mut router = Router::new();
//! router.use_middleware(timeout(Duration::from_secs(2)));
//!
//! let mut api = router.group("/api");
//! api.get("/users/:id", |_: &Request, ctx: &mut Context| {
//!     let id = ctx.param("id").unwrap_or_default().to_owned();
//!     ctx.response().json(StatusCode::Ok, &format!("{{\"id\":\"{id}\"}}"));
//! }).unwrap();
//! api.get("/static/*path", |_: &Request, ctx: &mut Context| {
//!     let path = ctx.param("path").unwrap_or_default().to_owned();
//!     ctx.response().write(path);
//! }).unwrap();
//!
//! let server = Server::builder()
//!     .bind("0.0.0.0:8080")
//!     .router(router)
//!     .build()
//!     .unwrap();
//! println!("{}", server.local_addr());
//! server.launch().unwrap();
//! ```

pub(crate) mod http {
    pub(crate) mod chunked;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod router {
    pub(crate) mod context;
    pub(crate) mod middleware;
    pub(crate) mod node;
    pub(crate) mod router_impl;

    pub(crate) use router_impl::{normalize_into, Route};
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod event_loop;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;
pub(crate) mod pool;

pub use crate::{
    errors::{ErrorKind, RouteError, ServerError},
    http::{
        request::{ParseStatus, Request},
        response::{write::WriteBuffer, ResponseWriter},
        types::{HeaderMap, StatusCode, Version},
    },
    pool::{Pool, Reusable},
    router::{
        context::{Context, Params},
        middleware::{timeout, BoxMiddleware, Middleware, Timeout},
        router_impl::{normalize, BoxHandler, Group, Handler, Router},
    },
    server::{
        connection::{Action, ConnBuffer, ConnState, Connection, Engine},
        server_impl::{Server, ServerBuilder, ServerHandle},
    },
};
