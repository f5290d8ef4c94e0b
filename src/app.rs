//! Application: router plus middleware, and the per-request dispatch loop.

use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, error};

use crate::error::{ChainError, HandlerError};
use crate::exchange::Exchange;
use crate::handler::{Deferred, Reply};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// A router wrapped in a middleware stack.
///
/// ```rust
/// use std::sync::Arc;
///
/// use hourglass::{App, Method, Request, Router, StatusCode};
/// use hourglass::middleware::timing::TimingMiddleware;
/// use hourglass::timer::InMemoryRegistry;
///
/// # async fn get_order(_: Request) -> StatusCode { StatusCode::OK }
/// let registry = Arc::new(InMemoryRegistry::new());
/// let app = App::new(Router::new().on(Method::GET, "/orders/{id}", get_order))
///     .layer(TimingMiddleware::new(registry.clone()));
/// ```
pub struct App {
    router: Router,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl App {
    pub fn new(router: Router) -> Self {
        Self { router, middleware: Vec::new() }
    }

    /// Adds a middleware. The first one added is the outermost.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Serves one request to completion, including any deferred work.
    ///
    /// Never fails: errors escaping the chain are rendered as responses. If
    /// that happens while work is still deferred, the work is dropped and the
    /// open timing context is stopped without recording.
    pub async fn handle(&self, mut request: Request) -> Response {
        let route = match self.router.lookup(request.method(), request.path()) {
            Some((route, params)) => {
                request.params = params;
                Some(route)
            }
            None => None,
        };
        let mut exchange = Exchange::new(request, route);

        loop {
            if let Err(err) = Next::new(&self.middleware).run(&mut exchange).await {
                render_error(&mut exchange, &err);
                if exchange.take_pending().is_some() {
                    debug!("dropping deferred work after chain error");
                }
                if let Some(timing) = exchange.timing() {
                    timing.abandon();
                }
                break;
            }
            let Some(work) = exchange.take_pending() else {
                break;
            };
            debug!("running deferred work");
            match run_deferred(work).await {
                // The failure is rendered here, before the next pass, and kept
                // on the exchange for whoever wants to know about it.
                Reply::Ready(Err(err)) => {
                    let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    error!(error = %err, %status, "deferred work failed");
                    exchange.set_response(Response::status(status));
                    exchange.stash_error(err);
                    exchange.resume(None);
                }
                reply => exchange.resume(Some(reply)),
            }
        }

        exchange.into_response()
    }
}

/// Runs deferred work on its own task. A panic there becomes a `Panic` error.
async fn run_deferred(work: Deferred) -> Reply {
    match tokio::spawn(work.0).await {
        Ok(reply) => reply,
        Err(e) if e.is_panic() => {
            Reply::Ready(Err(HandlerError::named("Panic", "deferred work panicked")))
        }
        Err(e) => Reply::Ready(Err(HandlerError::new(e))),
    }
}

/// Keeps a 4xx/5xx set further down the chain; anything else becomes 500.
fn render_error(exchange: &mut Exchange, err: &ChainError) {
    let status = match exchange.status() {
        s if s.is_client_error() || s.is_server_error() => s,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!(error = %err, %status, "request failed");
    exchange.set_response(Response::status(status));
}
