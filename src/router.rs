//! Radix-tree request router and route descriptors.
//!
//! One tree per HTTP method. O(path-length) lookup. Every registration
//! produces a [`Route`]: the handler plus what the rest of the stack needs to
//! know about it (its display name and its timing configuration), resolved
//! once at startup rather than on every request.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::{BoxedHandler, Handler};
use crate::middleware::timing::Timed;

// ── Route ────────────────────────────────────────────────────────────────────

/// A registered handler and its metadata.
pub struct Route {
    method: Method,
    pattern: String,
    name: String,
    handler: BoxedHandler,
    timed: Vec<Timed>,
}

impl Route {
    /// A route named after the handler's type path (`orders::get` becomes
    /// `orders#get`). Override with [`Route::name`].
    pub fn new<H: Handler>(method: Method, pattern: &str, handler: H) -> Self {
        Self {
            method,
            pattern: pattern.to_owned(),
            name: handler_name::<H>(),
            handler: handler.into_boxed_handler(),
            timed: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a timing declaration. May be called more than once; each entry
    /// yields its own timer.
    pub fn timed(mut self, timed: Timed) -> Self {
        self.timed.push(timed);
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn pattern(&self) -> &str { &self.pattern }
    pub fn handler_name(&self) -> &str { &self.name }
    pub fn timing(&self) -> &[Timed] { &self.timed }

    pub(crate) fn handler(&self) -> &BoxedHandler { &self.handler }
}

/// `my_app::orders::get` -> `orders#get`; a bare `get` stays `get`.
fn handler_name<H>() -> String {
    let full = std::any::type_name::<H>();
    let mut segments = full.rsplit("::");
    match (segments.next(), segments.next()) {
        (Some(func), Some(module)) => format!("{module}#{func}"),
        _ => full.to_owned(),
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

/// The application router.
///
/// Build it once at startup; hand it to [`App::new`](crate::App::new).
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Arc<Route>>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// ```rust
    /// # use hourglass::{Method, Request, Response, Router};
    /// # async fn get_order(_: Request) -> Response { Response::text("") }
    /// # async fn create_order(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::GET,  "/orders/{id}", get_order)
    ///     .on(Method::POST, "/orders",      create_order);
    /// ```
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route(Route::new(method, path, handler))
    }

    /// Register a fully described route.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is invalid or conflicts with an existing route.
    /// Routes are registered at startup, where a bad table is a bug.
    pub fn route(mut self, route: Route) -> Self {
        let pattern = route.pattern.clone();
        self.routes
            .entry(route.method.clone())
            .or_default()
            .insert(pattern.as_str(), Arc::new(route))
            .unwrap_or_else(|e| panic!("invalid route `{pattern}`: {e}"));
        self
    }

    pub(crate) fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(Arc<Route>, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let route = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((route, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}
