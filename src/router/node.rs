use crate::{
    errors::RouteError,
    router::{context::Params, Route},
};
use std::{collections::HashMap, fmt::Write, ops::Range, sync::Arc};

/// Segment kind of a route template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Static(&'a str),
    Param(&'a str),
    Splat(&'a str),
}

impl<'a> Segment<'a> {
    #[inline]
    pub(crate) fn parse(part: &'a str) -> Self {
        if let Some(name) = part.strip_prefix(':') {
            Segment::Param(name)
        } else if let Some(name) = part.strip_prefix('*') {
            Segment::Splat(name)
        } else {
            Segment::Static(part)
        }
    }

    #[inline(always)]
    pub(crate) fn is_dynamic(&self) -> bool {
        !matches!(self, Segment::Static(_))
    }
}

/// Trie node: static children, at most one `:param` child and at most one
/// terminal `*splat` child. Lookup prefers them in that order.
#[derive(Default)]
pub(crate) struct Node {
    part: String,
    name: Arc<str>,
    children: HashMap<String, Node>,
    param: Option<Box<Node>>,
    wildcard: Option<Box<Node>>,
    routes: HashMap<String, Route>,
}

impl Node {
    pub(crate) fn root() -> Self {
        Node {
            part: "/".to_owned(),
            ..Default::default()
        }
    }

    fn dynamic(part: &str, name: &str) -> Self {
        Node {
            part: part.to_owned(),
            name: Arc::from(name),
            ..Default::default()
        }
    }

    /// Checks that `segments` can be inserted for `method` without touching
    /// the trie. `this` is `None` once the walk leaves the existing nodes.
    pub(crate) fn check(
        this: Option<&Node>,
        method: &str,
        path: &str,
        segments: &[Segment<'_>],
    ) -> Result<(), RouteError> {
        let Some((first, rest)) = segments.split_first() else {
            if this.is_some_and(|node| node.routes.contains_key(method)) {
                return Err(RouteError::Duplicate {
                    method: method.to_owned(),
                    path: path.to_owned(),
                });
            }
            return Ok(());
        };

        let next = match *first {
            Segment::Static(part) => this.and_then(|node| node.children.get(part)),
            Segment::Param(name) => {
                if name.is_empty() {
                    return Err(RouteError::EmptyParamName(path.to_owned()));
                }
                let next = this.and_then(|node| node.param.as_deref());
                check_name(next, name, path)?;
                next
            }
            Segment::Splat(name) => {
                if name.is_empty() {
                    return Err(RouteError::EmptyParamName(path.to_owned()));
                }
                if !rest.is_empty() {
                    return Err(RouteError::SplatNotTerminal(path.to_owned()));
                }
                let next = this.and_then(|node| node.wildcard.as_deref());
                check_name(next, name, path)?;
                next
            }
        };

        Node::check(next, method, path, rest)
    }

    /// Inserts a route already validated by [`check`](Self::check).
    pub(crate) fn insert(&mut self, method: &str, segments: &[Segment<'_>], route: Route) {
        let Some((first, rest)) = segments.split_first() else {
            self.routes.insert(method.to_owned(), route);
            return;
        };

        let next = match *first {
            Segment::Static(part) => self.children.entry(part.to_owned()).or_insert_with(|| Node {
                part: part.to_owned(),
                ..Default::default()
            }),
            Segment::Param(name) => self
                .param
                .get_or_insert_with(|| Box::new(Node::dynamic(&format!(":{name}"), name))),
            Segment::Splat(name) => self
                .wildcard
                .get_or_insert_with(|| Box::new(Node::dynamic(&format!("*{name}"), name))),
        };

        next.insert(method, rest, route);
    }

    /// Finds the node serving `segments` of `path`, capturing parameters.
    ///
    /// Static children are tried first, then the parameter child, then the
    /// splat child, backtracking when a branch dead-ends. With `Some(method)`
    /// only nodes holding a route for that method match; with `None` any node
    /// with a route does.
    pub(crate) fn find<'a>(
        &'a self,
        path: &str,
        method: Option<&str>,
        segments: &[Range<usize>],
        params: &mut Params,
    ) -> Option<&'a Node> {
        let Some((segment, rest)) = segments.split_first() else {
            return self.serves(method).then_some(self);
        };

        if let Some(child) = self.children.get(&path[segment.clone()]) {
            if let Some(found) = child.find(path, method, rest, params) {
                return Some(found);
            }
        }

        if let Some(child) = self.param.as_deref() {
            let mark = params.len();
            params.push(child.name.clone(), segment.clone());

            if let Some(found) = child.find(path, method, rest, params) {
                return Some(found);
            }
            params.truncate(mark);
        }

        if let Some(child) = self.wildcard.as_deref() {
            if child.serves(method) {
                let end = rest.last().map_or(segment.end, |last| last.end);
                params.push(child.name.clone(), segment.start..end);
                return Some(child);
            }
        }

        None
    }

    #[inline]
    fn serves(&self, method: Option<&str>) -> bool {
        match method {
            Some(method) => self.routes.contains_key(method),
            None => !self.routes.is_empty(),
        }
    }

    #[inline]
    pub(crate) fn route(&self, method: &str) -> Option<&Route> {
        self.routes.get(method)
    }

    /// Checks that every splat node is a leaf.
    pub(crate) fn verify(&self) -> Result<(), RouteError> {
        if self.part.starts_with('*')
            && (!self.children.is_empty() || self.param.is_some() || self.wildcard.is_some())
        {
            return Err(RouteError::SplatHasChildren(self.part.clone()));
        }

        self.children
            .values()
            .chain(self.param.as_deref())
            .chain(self.wildcard.as_deref())
            .try_for_each(Node::verify)
    }

    /// Renders the subtree, one node per line, static children sorted.
    pub(crate) fn dump(&self, depth: usize, out: &mut String) {
        let _ = write!(out, "{:depth$}- '{}'", "", self.part, depth = depth);
        if !self.routes.is_empty() {
            let mut methods: Vec<_> = self.routes.keys().map(String::as_str).collect();
            methods.sort_unstable();
            let _ = write!(out, " [{}]", methods.join(","));
        }
        out.push('\n');

        let mut children: Vec<_> = self.children.values().collect();
        children.sort_unstable_by(|a, b| a.part.cmp(&b.part));

        for child in children
            .into_iter()
            .chain(self.param.as_deref())
            .chain(self.wildcard.as_deref())
        {
            child.dump(depth + 1, out);
        }
    }
}

#[inline]
fn check_name(existing: Option<&Node>, name: &str, path: &str) -> Result<(), RouteError> {
    match existing {
        Some(node) if &*node.name != name => Err(RouteError::ParamConflict {
            path: path.to_owned(),
            existing: node.name.to_string(),
            new: name.to_owned(),
        }),
        _ => Ok(()),
    }
}
