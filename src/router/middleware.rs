use crate::{
    router::router_impl::{BoxHandler, Handler},
    Context, Request, StatusCode,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Wraps a handler into another handler.
///
/// Middleware is applied once, when a route is registered, so the per-request
/// cost is one extra indirect call per layer.
///
/// Implemented for every `Fn(BoxHandler) -> BoxHandler` closure.
///
/// # Examples
/// ```
/// use buff_web::{BoxHandler, Context, Handler, Request, Router};
/// use std::sync::Arc;
///
/// fn powered_by(next: BoxHandler) -> BoxHandler {
///     Arc::new(move |req: &Request, ctx: &mut Context| {
///         ctx.response().set_header("X-Powered-By", "buff_web");
///         next.handle(req, ctx);
///     })
/// }
///
/// let mut router = Router::new();
/// router.use_middleware(powered_by);
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

impl<F> Middleware for F
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
    #[inline]
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        self(next)
    }
}

/// Shared, type-erased middleware.
pub type BoxMiddleware = Arc<dyn Middleware>;

const TIMEOUT: &str = "{\"error\":\"timeout\"}\n";

/// Bounds a handler with a deadline.
///
/// The deadline is stored on the [`Context`], where the handler can poll it
/// with [`Context::deadline_exceeded`]. When the handler returns after the
/// deadline, its response is dropped and replaced with
/// `504 {"error":"timeout"}`; the replacement is sealed so nothing written
/// later can alter it.
///
/// # Examples
/// ```
/// use buff_web::{timeout, Context, Request, Router};
/// use std::time::Duration;
///
/// let mut router = Router::new();
/// router.use_middleware(timeout(Duration::from_millis(200)));
/// router.get("/slow", |_: &Request, ctx: &mut Context| {
///     for step in 0..10 {
///         if ctx.deadline_exceeded() {
///             return;
///         }
///         ctx.response().write(step);
///     }
/// }).unwrap();
/// ```
#[inline]
pub fn timeout(limit: Duration) -> Timeout {
    Timeout { limit }
}

/// Middleware returned by [`timeout`].
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    limit: Duration,
}

impl Middleware for Timeout {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        let limit = self.limit;

        Arc::new(move |req: &Request, ctx: &mut Context| {
            let deadline = Instant::now() + limit;
            // An outer, tighter deadline stays in force.
            if ctx.deadline().map_or(true, |outer| deadline < outer) {
                ctx.set_deadline(deadline);
            }

            next.handle(req, ctx);

            if ctx.deadline_exceeded() && ctx.claim_timeout() {
                tracing::debug!(path = %ctx.path(), ?limit, "handler exceeded its deadline");

                let writer = ctx.response();
                writer.reset();
                writer.json(StatusCode::GatewayTimeout, TIMEOUT);
                writer.seal();
            }
        })
    }
}
