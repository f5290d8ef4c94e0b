//! Request timing.
//!
//! [`TimingMiddleware`] measures every exchange from the moment it first
//! enters the middleware until its final outcome is known, and records the
//! elapsed time with tags describing that outcome.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hourglass::{App, Method, Request, Response, Router, Server};
//! use hourglass::middleware::timing::TimingMiddleware;
//! use hourglass::timer::TracingRegistry;
//!
//! # async fn get_order(_: Request) -> Response { Response::text("") }
//! # async fn run() -> Result<(), hourglass::Error> {
//! let app = App::new(Router::new().on(Method::GET, "/orders/{id}", get_order))
//!     .layer(TimingMiddleware::new(Arc::new(TracingRegistry)));
//!
//! Server::bind("0.0.0.0:3000")?.serve(app).await
//! # }
//! ```
//!
//! # Deferred requests
//!
//! A deferred request passes through the middleware several times. The
//! first pass starts the sample and stores a [`TimingContext`] on the
//! exchange; later passes find it there and reuse it. Only the pass that
//! ends with no more deferred work stops the sample:
//!
//! ```text
//! pass 1  start ─► chain ─► handler defers      (sample left running)
//! pass 2  reuse ─► chain ─► work defers again   (sample left running)
//! pass 3  reuse ─► chain ─► reply applied ─► stop + record
//! ```
//!
//! # Failures
//!
//! Nothing the middleware does can change the response or the error seen by
//! the caller. If the tags provider panics or the registry refuses the
//! measurement, a warning is logged and the request carries on.

mod tags;
mod timed;

pub use tags::{DefaultTagsProvider, Failure, NONE, Outcome, TagsProvider, family};
pub use timed::{AutoTimer, Timed};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use http::StatusCode;
use tracing::{Instrument, Span, debug, warn};

use crate::error::ChainError;
use crate::exchange::Exchange;
use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::router::Route;
use crate::timer::{HandlerContext, Registry, ResponseMeta, Sample, Scope};

/// Default metric name for request timers.
pub const DEFAULT_METRIC_NAME: &str = "http.server.requests";

// ── TimingContext ────────────────────────────────────────────────────────────

/// Timing state for one exchange, stored on the exchange by the first pass.
pub struct TimingContext {
    running: Mutex<Option<Running>>,
    span: Span,
    handler_context: Arc<HandlerContext>,
}

struct Running {
    sample: Sample,
    scope: Scope,
}

impl TimingContext {
    fn start(registry: Arc<dyn Registry>, request: &Request) -> Self {
        let handler_context = Arc::new(HandlerContext::from_request(request));
        let sample = Sample::start(registry, Arc::clone(&handler_context));
        let scope = sample.make_current();
        Self {
            span: scope.span().clone(),
            running: Mutex::new(Some(Running { sample, scope })),
            handler_context,
        }
    }

    /// Request metadata captured when timing started.
    pub fn handler_context(&self) -> &Arc<HandlerContext> { &self.handler_context }

    pub fn span(&self) -> &Span { &self.span }

    /// True once the sample has been stopped.
    pub fn is_finished(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Hands out the running sample. Returns `Some` exactly once.
    fn finish(&self) -> Option<Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Stops a sample that will never reach the timing middleware again,
    /// recording nothing. No-op once finished.
    pub(crate) fn abandon(&self) {
        let Some(Running { sample, scope }) = self.finish() else {
            return;
        };
        scope.close();
        warn!("exchange dropped before completing; dropping timer metrics");
        if catch_unwind(AssertUnwindSafe(|| sample.stop(&[]))).is_err() {
            warn!("timer registry panicked; dropping timer metrics");
        }
    }
}

// ── TimingMiddleware ─────────────────────────────────────────────────────────

pub struct TimingMiddleware {
    registry: Arc<dyn Registry>,
    tags_provider: Box<dyn TagsProvider>,
    metric_name: String,
    auto_timer: AutoTimer,
}

impl TimingMiddleware {
    /// Times every request into `registry` with the default settings.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self::builder(registry).build()
    }

    pub fn builder(registry: Arc<dyn Registry>) -> TimingMiddlewareBuilder {
        TimingMiddlewareBuilder {
            registry,
            tags_provider: Box::new(DefaultTagsProvider::new()),
            metric_name: DEFAULT_METRIC_NAME.to_owned(),
            auto_timer: AutoTimer::default(),
        }
    }

    /// Returns the timing context of `exchange`, starting one if this is the
    /// first pass.
    fn context_for(&self, exchange: &mut Exchange) -> Arc<TimingContext> {
        if let Some(existing) = exchange.timing() {
            return Arc::clone(existing);
        }
        let context = Arc::new(TimingContext::start(Arc::clone(&self.registry), exchange.request()));
        exchange.attach_timing(Arc::clone(&context));
        context
    }

    /// Stops the sample of a finished exchange. Never fails and never panics
    /// outward; problems are logged.
    fn record(&self, timing: &TimingContext, exchange: &Exchange, failure: Option<Failure<'_>>) {
        let Some(Running { sample, scope }) = timing.finish() else {
            debug!("timing already stopped for this exchange");
            return;
        };
        let outcome = Outcome::classify(exchange.status(), failure);
        sample.context().set_response(ResponseMeta {
            status: exchange.status(),
            error: outcome.error_class().map(str::to_owned),
        });

        let route = exchange.route().map(Arc::as_ref);
        let tags = catch_unwind(AssertUnwindSafe(|| {
            self.tags_provider.tags(exchange, route, &outcome)
        }));
        scope.close();

        let timers = match tags {
            Ok(tags) => {
                let declared = route.map(Route::timing).unwrap_or_default();
                timed::timers(self.auto_timer, &self.metric_name, declared, &tags)
            }
            Err(_) => {
                warn!("tags provider panicked; dropping timer metrics");
                Vec::new()
            }
        };
        match catch_unwind(AssertUnwindSafe(|| sample.stop(&timers))) {
            Ok(Ok(elapsed)) => debug!(
                outcome = outcome.as_str(),
                elapsed_us = elapsed.as_micros() as u64,
                "exchange timed"
            ),
            Ok(Err(e)) => warn!(error = %e, "failed to record timer metrics"),
            Err(_) => warn!("timer registry panicked; dropping timer metrics"),
        }
    }
}

impl Middleware for TimingMiddleware {
    fn handle<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), ChainError>> {
        Box::pin(async move {
            let timing = self.context_for(exchange);
            let span = timing.span().clone();

            match next.run(exchange).instrument(span).await {
                Ok(()) if exchange.is_async_started() => {
                    debug!("exchange deferred; timing stays open");
                    Ok(())
                }
                Ok(()) => {
                    let failure = exchange.error().map(Failure::Captured);
                    self.record(&timing, exchange, failure);
                    Ok(())
                }
                Err(err) => {
                    let status = exchange.status();
                    if !status.is_client_error() && !status.is_server_error() {
                        exchange.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    self.record(&timing, exchange, Some(Failure::raised(&err)));
                    Err(err)
                }
            }
        })
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct TimingMiddlewareBuilder {
    registry: Arc<dyn Registry>,
    tags_provider: Box<dyn TagsProvider>,
    metric_name: String,
    auto_timer: AutoTimer,
}

impl TimingMiddlewareBuilder {
    /// Defaults to [`DEFAULT_METRIC_NAME`].
    pub fn metric_name(mut self, name: impl Into<String>) -> Self {
        self.metric_name = name.into();
        self
    }

    /// Whether routes without a [`Timed`] declaration are timed. Defaults to on.
    pub fn auto_time(mut self, auto_timer: AutoTimer) -> Self {
        self.auto_timer = auto_timer;
        self
    }

    pub fn tags_provider(mut self, provider: impl TagsProvider) -> Self {
        self.tags_provider = Box::new(provider);
        self
    }

    pub fn build(self) -> TimingMiddleware {
        TimingMiddleware {
            registry: self.registry,
            tags_provider: self.tags_provider,
            metric_name: self.metric_name,
            auto_timer: self.auto_timer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::InMemoryRegistry;

    #[test]
    fn context_finishes_exactly_once() {
        let registry = Arc::new(InMemoryRegistry::new());
        let ctx = TimingContext::start(registry.clone(), &Request::builder().build());
        assert!(!ctx.is_finished());
        assert!(ctx.finish().is_some());
        assert!(ctx.finish().is_none());
        assert!(ctx.is_finished());
        assert_eq!(registry.started(), 1);
    }

    #[test]
    fn concurrent_finish_hands_out_one_sample() {
        let registry = Arc::new(InMemoryRegistry::new());
        let ctx = Arc::new(TimingContext::start(registry, &Request::builder().build()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || ctx.finish().is_some())
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn handler_context_is_captured_at_start() {
        let registry = Arc::new(InMemoryRegistry::new());
        let req = Request::builder()
            .uri("http://api.local:8080/orders/42?expand=1")
            .remote_addr("10.0.0.7:51000".parse().unwrap())
            .build();
        let ctx = TimingContext::start(registry, &req);
        let hc = ctx.handler_context();
        assert_eq!(hc.method, http::Method::GET);
        assert_eq!(hc.scheme, "http");
        assert_eq!(hc.host.as_deref(), Some("api.local"));
        assert_eq!(hc.target, "/orders/42?expand=1");
        assert_eq!(hc.remote_addr, Some("10.0.0.7:51000".parse().unwrap()));
    }
}
