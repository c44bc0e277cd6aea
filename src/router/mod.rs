//! Request routing: map method + path to a registered [`RoutingEntry`].
//!
//! This module provides [`Router`], which resolves an incoming request to the
//! handler that should run and the processing group it runs on. Two segment
//! styles are supported in patterns:
//!
//! | Pattern              | Example match     | Captured params |
//! |----------------------|-------------------|-----------------|
//! | `/users`             | `/users`          | *(none)*        |
//! | `/users/{id}`        | `/users/42`       | `id → "42"`     |
//! | `/users/:id`         | `/users/42`       | `id → "42"`     |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so `/users/` and
//! `/users` are treated as equivalent.
//!
//! ## Resolution order
//!
//! Every leaf whose shape matches the path is a candidate. The candidate with the
//! highest specificity metric wins: segment `i` contributes `1 << (63 - i)` when it is a
//! literal. `/a/b` therefore beats `/a/{x}`, which beats `/{x}/b`. Two routes with the same
//! method and the same shape would tie, so registering the second one is a
//! [`RouteError::Conflict`]; the registration-order tie-break exists only as a fallback.
//!
//! The router is built during startup and is read-only afterwards; [`Router::resolve`]
//! takes `&self` and is safe for any number of concurrent readers.

mod entry;
mod tree;

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::context::Parameters;
use crate::http::Method;

pub use entry::{
    Controller, FunctionController, Handler, HandlerError, HandlerResult, Route, RoutingEntry,
};
use tree::{RouteNode, Segment};

/// Errors raised while registering routes. Fatal to service start-up.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {identifier} conflicts with already registered {existing}")]
    Conflict {
        identifier: String,
        existing: String,
    },

    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
}

/// A successful resolution: the selected entry plus the bound path parameters.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub entry: Arc<RoutingEntry>,
    pub params: Parameters,
}

/// Routing tree plus the list of entries in registration order.
///
/// # Examples
///
/// ```
/// use restline::{Method, Route, Router};
///
/// let mut router = Router::new();
/// router.register(Route::from_fn(Method::Get, "/items/{id}", "default", |_ctx| Ok(()))).unwrap();
/// router.register(Route::from_fn(Method::Get, "/items/latest", "default", |_ctx| Ok(()))).unwrap();
///
/// let hit = router.resolve(&Method::Get, "/items/latest").unwrap();
/// assert_eq!(hit.entry.identifier(), "GET/items/latest");
///
/// let hit = router.resolve(&Method::Get, "/items/42").unwrap();
/// assert_eq!(hit.params.get("id"), Some("42"));
/// ```
#[derive(Default)]
pub struct Router {
    root: RouteNode,
    entries: Vec<Arc<RoutingEntry>>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route, inserting a new leaf into the tree.
    ///
    /// # Errors
    ///
    /// - [`RouteError::InvalidPattern`]: the pattern does not compile.
    /// - [`RouteError::Conflict`]: a route with the same method and the same shape
    ///   (same literals, parameters at the same positions) is already registered. The
    ///   tree is left untouched.
    pub fn register(&mut self, route: Route) -> Result<Arc<RoutingEntry>, RouteError> {
        let segments = tree::parse_pattern(&route.pattern)?;
        let pattern = normalized(&segments);
        let identifier = format!("{}{pattern}", route.method.as_str());
        let method = route.method.as_str();

        if let Some(existing) = self.root.occupant(method, &segments) {
            return Err(RouteError::Conflict {
                identifier,
                existing: existing.identifier.clone(),
            });
        }

        let params = segments
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Segment::Param(name) => Some((i, name.clone())),
                Segment::Literal(_) => None,
            })
            .collect();

        let entry = Arc::new(RoutingEntry {
            identifier,
            method: route.method,
            pattern,
            params,
            group: route.group,
            controller: route.controller,
            handler: route.handler,
            content_type: route.content_type,
            metrics: tree::metrics(&segments),
            sequence: self.entries.len() as u64,
        });

        self.root.insert(entry.method.as_str(), &segments, Arc::clone(&entry));
        self.entries.push(Arc::clone(&entry));

        debug!(
            route = %entry.identifier,
            group = %entry.group,
            controller = entry.controller.name(),
            "route registered"
        );
        Ok(entry)
    }

    /// Resolve `method` + `path` to the most specific entry.
    ///
    /// Returns `None` when nothing matches. For a fixed set of registrations the
    /// result depends only on the arguments.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let segments: Vec<&str> = std::iter::once(method.as_str())
            .chain(tree::split_path(path))
            .collect();

        let mut candidates = Vec::new();
        self.root.collect(&segments, &mut candidates);

        let entry = candidates.into_iter().max_by(|a, b| {
            a.metrics
                .cmp(&b.metrics)
                .then_with(|| b.sequence.cmp(&a.sequence))
        })?;

        let mut params = Parameters::new();
        for (index, name) in &entry.params {
            // +1 skips the method segment
            params.insert(name.as_str(), segments[index + 1]);
        }

        Some(RouteMatch {
            entry: Arc::clone(entry),
            params,
        })
    }

    /// Look up an entry by its identifier.
    pub fn get(&self, identifier: &str) -> Option<&Arc<RoutingEntry>> {
        self.entries.iter().find(|e| e.identifier == identifier)
    }

    /// Entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<RoutingEntry>> {
        self.entries.iter()
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// `/items/{id}`: parameters are written in brace form whatever the input style.
fn normalized(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "/".to_owned();
    }
    let mut pattern = String::new();
    for segment in segments {
        pattern.push('/');
        match segment {
            Segment::Literal(s) => pattern.push_str(s),
            Segment::Param(name) => {
                pattern.push('{');
                pattern.push_str(name);
                pattern.push('}');
            }
        }
    }
    pattern
}
