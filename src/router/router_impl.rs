use crate::{
    errors::RouteError,
    router::{
        context::Context,
        middleware::BoxMiddleware,
        node::{Node, Segment},
    },
    Middleware, Request, StatusCode,
};
use smallvec::SmallVec;
use std::{borrow::Cow, collections::HashMap, ops::Range, sync::Arc};

/// A request handler.
///
/// Handlers run inline on the event loop that owns the connection, so they
/// must not block: a slow handler stalls every connection of its loop.
/// Panics are caught by the engine and turned into `500` responses.
///
/// Implemented for every `Fn(&Request, &mut Context)` closure.
///
/// # Examples
/// ```
/// use buff_web::{Context, Handler, Request, StatusCode};
///
/// struct Health;
///
/// impl Handler for Health {
///     fn handle(&self, _: &Request, ctx: &mut Context) {
///         ctx.response().write_header(StatusCode::NoContent);
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &Request, ctx: &mut Context);
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Context) + Send + Sync + 'static,
{
    #[inline(always)]
    fn handle(&self, req: &Request, ctx: &mut Context) {
        self(req, ctx)
    }
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

pub(crate) struct Route {
    pub(crate) handler: BoxHandler,
    pub(crate) template: String,
}

/// Router lookup result.
pub(crate) enum Lookup<'r> {
    Found(&'r Route),
    MethodNotAllowed,
    NotFound,
}

const NOT_FOUND: &str = "{\"error\":\"route not found\"}\n";
const METHOD_NOT_ALLOWED: &str = "{\"error\":\"method not allowed\"}\n";

/// Method + path router.
///
/// Routes without `:`/`*` segments live in an exact-match table per method;
/// everything else goes into a segment trie. Lookups try the table first.
///
/// Registration takes `&mut self` and serving takes `&self`: once the router
/// is handed to a [`Server`](crate::Server) it is shared immutably between
/// event loops and can no longer change.
///
/// # Route templates
/// - `/users/new`: static
/// - `/users/:id`: `:id` captures exactly one segment
/// - `/files/*path`: `*path` captures the rest of the path (slashes included),
///   must be the last segment
///
/// # Examples
/// ```
/// use buff_web::{Context, Request, Router};
///
/// let mut router = Router::new();
/// router.get("/hello", |_: &Request, ctx: &mut Context| {
///     ctx.response().write("hello");
/// }).unwrap();
///
/// let mut api = router.group("/api/v1");
/// api.post("/users/:id", |_: &Request, ctx: &mut Context| {
///     let id = ctx.param("id").unwrap_or_default().to_owned();
///     ctx.response().write(id);
/// }).unwrap();
///
/// assert!(router.get("/hello/", |_: &Request, _: &mut Context| {}).is_err());
/// ```
pub struct Router {
    root: Node,
    fast: HashMap<String, HashMap<String, Route>>,
    middleware: Vec<BoxMiddleware>,
    not_found: BoxHandler,
    method_not_allowed: BoxHandler,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("static_routes", &self.fast.values().map(HashMap::len).sum::<usize>())
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            root: Node::root(),
            fast: HashMap::new(),
            middleware: Vec::new(),
            not_found: Arc::new(|_: &Request, ctx: &mut Context| {
                ctx.response().json(StatusCode::NotFound, NOT_FOUND);
            }),
            method_not_allowed: Arc::new(|_: &Request, ctx: &mut Context| {
                ctx.response().json(StatusCode::MethodNotAllowed, METHOD_NOT_ALLOWED);
            }),
        }
    }

    /// Adds router-wide middleware. Only routes registered afterwards are wrapped.
    pub fn use_middleware<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Replaces the default `404` handler.
    pub fn not_found<H: Handler>(&mut self, handler: H) -> &mut Self {
        self.not_found = Arc::new(handler);
        self
    }

    /// Registers `handler` for `method` and `path`.
    ///
    /// The method is upper-cased and the path normalized. On error the router
    /// is left exactly as it was.
    #[inline]
    pub fn handle<H: Handler>(&mut self, method: &str, path: &str, handler: H) -> Result<(), RouteError> {
        self.handle_with(method, path, handler, &[])
    }

    /// Same as [`handle`](Self::handle) with extra route middleware, applied
    /// inside the router-wide middleware, first element outermost.
    pub fn handle_with<H: Handler>(
        &mut self,
        method: &str,
        path: &str,
        handler: H,
        middleware: &[BoxMiddleware],
    ) -> Result<(), RouteError> {
        if !path.starts_with('/') {
            return Err(RouteError::InvalidPath(path.to_owned()));
        }

        let method = method.to_ascii_uppercase();
        let template = normalize(path);
        let segments: SmallVec<[Segment<'_>; 16]> = template
            .split('/')
            .filter(|part| !part.is_empty())
            .map(Segment::parse)
            .collect();

        let dynamic = segments.iter().any(Segment::is_dynamic);
        if dynamic {
            Node::check(Some(&self.root), &method, &template, &segments)?;
        } else if self.fast.get(&method).is_some_and(|m| m.contains_key(&template)) {
            return Err(RouteError::Duplicate {
                method,
                path: template.clone(),
            });
        }

        let handler = self
            .middleware
            .iter()
            .chain(middleware)
            .rev()
            .fold(Arc::new(handler) as BoxHandler, |next, mw| mw.wrap(next));

        tracing::debug!(%method, route = %template, "route registered");

        let route = Route {
            handler,
            template: template.clone(),
        };
        if dynamic {
            self.root.insert(&method, &segments, route);
        } else {
            self.fast
                .entry(method)
                .or_default()
                .insert(template.clone(), route);
        }

        Ok(())
    }

    /// Starts a group of routes sharing a path prefix and middleware.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group {
            router: self,
            base: join_prefix("", prefix),
            middleware: Vec::new(),
        }
    }

    /// Checks the trie invariants (every splat node is a leaf).
    pub fn verify(&self) -> Result<(), RouteError> {
        self.root.verify()
    }

    /// Human readable dump of the registered routes.
    pub fn dump(&self) -> String {
        let mut out = String::new();

        let mut fast: Vec<_> = self
            .fast
            .iter()
            .flat_map(|(method, paths)| paths.keys().map(move |path| (path, method)))
            .collect();
        fast.sort_unstable();
        for (path, method) in fast {
            out.push_str(method);
            out.push(' ');
            out.push_str(path);
            out.push('\n');
        }

        self.root.dump(0, &mut out);
        out
    }
}

macro_rules! method_shorthands {
    ($($(#[$docs:meta])* $name:ident => $method:literal;)*) => { $(
        $(#[$docs])*
        #[inline]
        pub fn $name<H: Handler>(&mut self, path: &str, handler: H) -> Result<(), RouteError> {
            self.handle($method, path, handler)
        }
    )* };
}

impl Router {
    method_shorthands! {
        /// Registers a `GET` route.
        get => "GET";
        /// Registers a `POST` route.
        post => "POST";
        /// Registers a `PUT` route.
        put => "PUT";
        /// Registers a `PATCH` route.
        patch => "PATCH";
        /// Registers a `DELETE` route.
        delete => "DELETE";
    }
}

// Serving
impl Router {
    /// Routes `req` and runs the matched handler, the `405` handler or the
    /// `404` handler.
    pub fn dispatch(&self, req: &Request, ctx: &mut Context) {
        ctx.set_path(req.path());

        let handler = match self.lookup(req.method(), ctx) {
            Lookup::Found(route) => {
                ctx.route.push_str(&route.template);
                &route.handler
            }
            Lookup::MethodNotAllowed => &self.method_not_allowed,
            Lookup::NotFound => &self.not_found,
        };

        handler.handle(req, ctx);
    }

    /// Resolves `ctx.path`, filling `ctx.params`.
    pub(crate) fn lookup(&self, method: &str, ctx: &mut Context) -> Lookup<'_> {
        let method = match method.bytes().any(|b| b.is_ascii_lowercase()) {
            true => Cow::Owned(method.to_ascii_uppercase()),
            false => Cow::Borrowed(method),
        };
        let path = ctx.path.as_str();

        if let Some(route) = self.fast.get(&*method).and_then(|m| m.get(path)) {
            return Lookup::Found(route);
        }

        let segments = split_segments(path);
        ctx.params.clear();
        if let Some(route) = self
            .root
            .find(path, Some(&method), &segments, &mut ctx.params)
            .and_then(|node| node.route(&method))
        {
            return Lookup::Found(route);
        }

        ctx.params.clear();
        let exists = self.root.find(path, None, &segments, &mut ctx.params).is_some();
        ctx.params.clear();
        if exists {
            return Lookup::MethodNotAllowed;
        }

        if self.fast.values().any(|m| m.contains_key(path)) {
            return Lookup::MethodNotAllowed;
        }
        Lookup::NotFound
    }
}

/// Routes registered under a common prefix. Created by [`Router::group`].
pub struct Group<'r> {
    router: &'r mut Router,
    base: String,
    middleware: Vec<BoxMiddleware>,
}

impl Group<'_> {
    /// Adds middleware to every route registered through this group afterwards.
    pub fn use_middleware<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Registers a route under the group prefix.
    pub fn handle<H: Handler>(&mut self, method: &str, path: &str, handler: H) -> Result<(), RouteError> {
        let full = join_prefix(&self.base, path);
        self.router
            .handle_with(method, &full, handler, &self.middleware)
    }

    /// Nested group; inherits this group's prefix and middleware.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group {
            base: join_prefix(&self.base, prefix),
            middleware: self.middleware.clone(),
            router: &mut *self.router,
        }
    }

    method_shorthands! {
        /// Registers a `GET` route under the prefix.
        get => "GET";
        /// Registers a `POST` route under the prefix.
        post => "POST";
        /// Registers a `PUT` route under the prefix.
        put => "PUT";
        /// Registers a `PATCH` route under the prefix.
        patch => "PATCH";
        /// Registers a `DELETE` route under the prefix.
        delete => "DELETE";
    }
}

#[inline]
fn join_prefix(base: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    let mut full = String::with_capacity(base.len() + path.len() + 1);
    full.push_str(base.trim_end_matches('/'));
    if !path.is_empty() || full.is_empty() {
        full.push('/');
        full.push_str(path);
    }
    full
}

/// Normalizes a path: leading `/`, no repeated `/`, no trailing `/` (except
/// for `/` itself). The empty path becomes `/`.
///
/// ```
/// assert_eq!(buff_web::normalize("//a///b/"), "/a/b");
/// assert_eq!(buff_web::normalize(""), "/");
/// ```
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    normalize_into(path, &mut out);
    out
}

#[inline]
pub(crate) fn normalize_into(path: &str, out: &mut String) {
    out.clear();
    out.push('/');

    for part in path.split('/').filter(|part| !part.is_empty()) {
        if out.len() > 1 {
            out.push('/');
        }
        out.push_str(part);
    }
}

/// Byte ranges of the segments of a normalized path.
#[inline]
fn split_segments(path: &str) -> SmallVec<[Range<usize>; 16]> {
    let mut segments = SmallVec::new();
    let mut start = 1;

    if path.len() <= 1 {
        return segments;
    }
    for slash in memchr::memchr_iter(b'/', &path.as_bytes()[1..]) {
        let end = slash + 1;
        segments.push(start..end);
        start = end + 1;
    }
    segments.push(start..path.len());

    segments
}

#[cfg(test)]
mod router_tests {
    use super::*;
    use crate::{limits::ConnLimits, ParseStatus};

    fn request(method: &str, path: &str) -> Request {
        let src = format!("{method} {path} HTTP/1.1\r\nHost: test\r\n\r\n");
        let mut req = Request::new();
        let status = req.parse(src.as_bytes(), &ConnLimits::default());
        assert!(matches!(status, Ok(ParseStatus::Complete { .. })));
        req
    }

    fn tag(name: &'static str) -> impl Handler {
        move |_: &Request, ctx: &mut Context| {
            ctx.response().write(name);
        }
    }

    fn serve(router: &Router, method: &str, path: &str) -> (StatusCode, String, Context) {
        let req = request(method, path);
        let mut ctx = Context::new();
        router.dispatch(&req, &mut ctx);
        let status = ctx.response().status();
        let body = String::from_utf8_lossy(ctx.response().body()).into_owned();
        (status, body, ctx)
    }

    #[test]
    fn normalize_paths() {
        #[rustfmt::skip]
        let cases = [
            ("",          "/"),
            ("/",         "/"),
            ("///",       "/"),
            ("a/b",       "/a/b"),
            ("/a//b///c", "/a/b/c"),
            ("/a/b/",     "/a/b"),
            ("//x//",     "/x"),
        ];

        for (path, expected) in cases {
            assert_eq!(normalize(path), expected);
        }

        assert!(split_segments("/").is_empty());
        let path = "/ab/c/def";
        let segments: Vec<_> = split_segments(path).into_iter().map(|r| &path[r]).collect();
        assert_eq!(segments, ["ab", "c", "def"]);
    }

    #[test]
    fn priorities() {
        let mut router = Router::new();
        router.get("/foo/new", tag("static")).unwrap();
        router.get("/foo/:id", tag("param")).unwrap();
        router.get("/foo/:id/edit", tag("edit")).unwrap();
        router.get("/foo/*rest", tag("splat")).unwrap();
        router.get("/static/*filepath", tag("files")).unwrap();

        #[rustfmt::skip]
        let cases = [
            ("/foo/new",           "static", vec![]),
            ("/foo/123",           "param",  vec![("id", "123")]),
            ("/foo//123/",         "param",  vec![("id", "123")]),
            ("/foo/123/edit",      "edit",   vec![("id", "123")]),
            ("/foo/new/edit",      "edit",   vec![("id", "new")]),
            ("/foo/1/2/3",         "splat",  vec![("rest", "1/2/3")]),
            ("/static/css/a.css",  "files",  vec![("filepath", "css/a.css")]),
        ];

        for (path, expected, params) in cases {
            let (status, body, ctx) = serve(&router, "GET", path);
            assert_eq!(status, StatusCode::Ok, "{path}");
            assert_eq!(body, expected, "{path}");
            assert_eq!(ctx.params().collect::<Vec<_>>(), params, "{path}");
        }

        let (_, _, ctx) = serve(&router, "GET", "/foo/123");
        assert_eq!(ctx.route(), "/foo/:id");
        assert_eq!(ctx.param("id"), Some("123"));
    }

    #[test]
    fn not_found_and_method_not_allowed() {
        let mut router = Router::new();
        router.get("/hello", tag("hello")).unwrap();
        router.post("/users/:id", tag("user")).unwrap();
        router.get("/files/*path", tag("files")).unwrap();

        #[rustfmt::skip]
        let cases = [
            ("GET",    "/hello",       StatusCode::Ok,               "hello"),
            ("get",    "/hello",       StatusCode::Ok,               "hello"),
            ("POST",   "/hello",       StatusCode::MethodNotAllowed, METHOD_NOT_ALLOWED),
            ("GET",    "/users/7",     StatusCode::MethodNotAllowed, METHOD_NOT_ALLOWED),
            ("GET",    "/users",       StatusCode::NotFound,         NOT_FOUND),
            ("GET",    "/files",       StatusCode::NotFound,         NOT_FOUND),
            ("DELETE", "/nope",        StatusCode::NotFound,         NOT_FOUND),
        ];

        for (method, path, status, body) in cases {
            let (got_status, got_body, ctx) = serve(&router, method, path);
            assert_eq!((got_status, got_body.as_str()), (status, body), "{method} {path}");
            if status != StatusCode::Ok {
                assert_eq!(ctx.route(), "");
                assert!(ctx.params.is_empty());
            }
        }

        router.not_found(tag("custom"));
        let (status, body, _) = serve(&router, "GET", "/missing");
        assert_eq!((status, body.as_str()), (StatusCode::Ok, "custom"));
    }

    #[test]
    fn backtracks_past_other_methods() {
        let mut router = Router::new();
        router.post("/users/:id", tag("update")).unwrap();
        router.get("/users/*rest", tag("browse")).unwrap();

        #[rustfmt::skip]
        let cases = [
            ("GET",    "/users/7",   StatusCode::Ok,               "browse",           vec![("rest", "7")]),
            ("GET",    "/users/7/a", StatusCode::Ok,               "browse",           vec![("rest", "7/a")]),
            ("POST",   "/users/7",   StatusCode::Ok,               "update",           vec![("id", "7")]),
            ("DELETE", "/users/7",   StatusCode::MethodNotAllowed, METHOD_NOT_ALLOWED, vec![]),
        ];

        for (method, path, status, body, params) in cases {
            let (got_status, got_body, ctx) = serve(&router, method, path);
            assert_eq!((got_status, got_body.as_str()), (status, body), "{method} {path}");
            assert_eq!(ctx.params().collect::<Vec<_>>(), params, "{method} {path}");
        }
    }

    #[test]
    fn registration_errors() {
        let mut router = Router::new();
        router.get("/a/:id", tag("a")).unwrap();
        router.get("/s", tag("s")).unwrap();
        router.get("/w/*rest", tag("w")).unwrap();
        let before = router.dump();

        #[rustfmt::skip]
        let cases = [
            ("GET", "s",            RouteError::InvalidPath("s".into())),
            ("GET", "/s/",          RouteError::Duplicate { method: "GET".into(), path: "/s".into() }),
            ("get", "/a//:id",      RouteError::Duplicate { method: "GET".into(), path: "/a/:id".into() }),
            ("GET", "/a/:name",     RouteError::ParamConflict {
                                        path: "/a/:name".into(), existing: "id".into(), new: "name".into() }),
            ("GET", "/b/:",         RouteError::EmptyParamName("/b/:".into())),
            ("GET", "/b/*",         RouteError::EmptyParamName("/b/*".into())),
            ("GET", "/b/*x/y",      RouteError::SplatNotTerminal("/b/*x/y".into())),
            ("GET", "/w/*other",    RouteError::ParamConflict {
                                        path: "/w/*other".into(), existing: "rest".into(), new: "other".into() }),
        ];

        for (method, path, expected) in cases {
            assert_eq!(router.handle(method, path, tag("x")), Err(expected), "{path}");
        }

        assert_eq!(router.dump(), before);
        assert!(router.post("/a/:id", tag("post")).is_ok());
        assert!(router.verify().is_ok());
    }

    #[test]
    fn groups_and_middleware() {
        struct Prefix(&'static str);

        impl Middleware for Prefix {
            fn wrap(&self, next: BoxHandler) -> BoxHandler {
                let tag = self.0;
                Arc::new(move |req: &Request, ctx: &mut Context| {
                    ctx.response().write(tag);
                    next.handle(req, ctx);
                })
            }
        }

        let mut router = Router::new();
        router.use_middleware(Prefix("r>"));

        let mut api = router.group("api/");
        api.use_middleware(Prefix("g>"));
        api.get("/users/:id", tag("user")).unwrap();
        api.group("/v2").get("", tag("v2")).unwrap();
        api.get("/", tag("root")).unwrap();

        router
            .handle_with("GET", "/plain", tag("plain"), &[Arc::new(Prefix("m>")) as BoxMiddleware])
            .unwrap();

        #[rustfmt::skip]
        let cases = [
            ("/api/users/9", "r>g>user"),
            ("/api/v2",      "r>g>v2"),
            ("/api",         "r>g>root"),
            ("/plain",       "r>m>plain"),
        ];

        for (path, expected) in cases {
            let (_, body, _) = serve(&router, "GET", path);
            assert_eq!(body, expected, "{path}");
        }
    }

    #[test]
    fn verify_and_dump() {
        let mut router = Router::new();
        router.get("/a/:id", tag("a")).unwrap();
        router.post("/a/:id", tag("a")).unwrap();
        router.get("/b", tag("b")).unwrap();

        assert_eq!(router.dump(), "GET /b\n- '/'\n - 'a'\n  - ':id' [GET,POST]\n");
        assert!(router.verify().is_ok());
    }
}
