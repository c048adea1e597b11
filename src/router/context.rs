use crate::{limits::RespLimits, pool::Reusable, ResponseWriter};
use smallvec::SmallVec;
use std::{
    any::Any,
    collections::HashMap,
    mem,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// One captured path parameter; `value` indexes the normalized request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Param {
    pub(crate) name: Arc<str>,
    pub(crate) value: Range<usize>,
}

/// Path parameters captured by the router, in route order.
///
/// Eight parameters are stored inline; deeper routes spill to the heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    inner: SmallVec<[Param; 8]>,
}

impl Params {
    #[inline(always)]
    pub(crate) fn push(&mut self, name: Arc<str>, value: Range<usize>) {
        self.inner.push(Param { name, value });
    }

    #[inline(always)]
    pub(crate) fn truncate(&mut self, len: usize) {
        self.inner.truncate(len);
    }

    #[inline(always)]
    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Heap bytes, zero while the parameters fit inline.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        match self.inner.spilled() {
            true => self.inner.capacity() * mem::size_of::<Param>(),
            false => 0,
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Per-request state handed to handlers and middleware.
///
/// A context binds the pooled [`ResponseWriter`], the captured path
/// parameters, the matched route template and a typed key/value store for
/// passing data from middleware to handlers. Contexts are pooled and reset
/// before every request; nothing borrowed from one may outlive the handler call.
///
/// # Examples
/// ```
/// use buff_web::{Context, Request, Router};
///
/// let mut router = Router::new();
/// router
///     .get("/users/:id/files/*path", |_: &Request, ctx: &mut Context| {
///         let id = ctx.param("id").unwrap_or_default().to_owned();
///         let path = ctx.param("path").unwrap_or_default().to_owned();
///         ctx.response().write(id).write(':').write(path);
///     })
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Context {
    writer: ResponseWriter,
    pub(crate) path: String,
    pub(crate) params: Params,
    pub(crate) route: String,
    store: HashMap<String, Box<dyn Any + Send>>,

    deadline: Option<Instant>,
    timed_out: AtomicBool,
}

impl Context {
    /// Creates a detached context, mainly useful for testing handlers.
    #[inline]
    pub fn new() -> Self {
        Context {
            path: String::with_capacity(64),
            route: String::with_capacity(64),
            ..Default::default()
        }
    }

    /// Attaches a pooled writer for the duration of one request.
    #[inline]
    pub(crate) fn attach(&mut self, writer: ResponseWriter) {
        self.writer = writer;
    }

    /// Detaches the writer so it can be finalized and released.
    #[inline]
    pub(crate) fn detach(&mut self) -> ResponseWriter {
        mem::take(&mut self.writer)
    }

    /// Stores the normalized form of `path` as the routed path.
    #[inline]
    pub(crate) fn set_path(&mut self, path: &str) {
        crate::router::normalize_into(path, &mut self.path);
    }
}

// Public API
impl Context {
    #[inline(always)]
    pub fn response(&mut self) -> &mut ResponseWriter {
        &mut self.writer
    }

    /// Value of a path parameter. With repeated names the last capture wins.
    #[inline]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .inner
            .iter()
            .rev()
            .find(|p| &*p.name == name)
            .map(|p| &self.path[p.value.clone()])
    }

    /// All captured `(name, value)` pairs in route order.
    #[inline]
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.params
            .inner
            .iter()
            .map(|p| (&*p.name, &self.path[p.value.clone()]))
    }

    /// Normalized request path that was routed.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Template of the matched route (`/users/:id`), empty when nothing matched.
    #[inline(always)]
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Stores a value for later middleware or the handler.
    #[inline]
    pub fn set<T: Any + Send>(&mut self, key: &str, value: T) {
        self.store.insert(key.to_owned(), Box::new(value));
    }

    /// Reads a stored value, `None` if absent or of another type.
    #[inline]
    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.store.get(key)?.downcast_ref()
    }

    /// Deadline set by a [`timeout`](crate::timeout) middleware.
    #[inline(always)]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline(always)]
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Whether the deadline has passed. Long-running handlers should poll this.
    #[inline]
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether the timeout response already replaced this request's response.
    #[inline(always)]
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Claims the response for the timeout path; only the first caller wins.
    #[inline]
    pub(crate) fn claim_timeout(&self) -> bool {
        self.timed_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Reusable for Context {
    #[inline]
    fn create(_: &RespLimits) -> Self {
        Context::new()
    }

    #[inline]
    fn reset(&mut self) {
        self.writer.reset();
        self.path.clear();
        self.params.clear();
        self.route.clear();
        self.store.clear();
        self.deadline = None;
        *self.timed_out.get_mut() = false;
    }

    #[inline]
    fn capacity(&self) -> usize {
        let slots = self.store.capacity() * mem::size_of::<(String, Box<dyn Any + Send>)>();
        let keys: usize = self.store.keys().map(String::capacity).sum();

        self.path.capacity() + self.route.capacity() + self.params.capacity() + slots + keys
    }
}
