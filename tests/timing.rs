use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hourglass::middleware::timing::{
    AutoTimer, Outcome, Timed, TimingContext, TimingMiddleware, TagsProvider,
};
use hourglass::middleware::{Middleware, Next};
use hourglass::timer::{HandlerContext, InMemoryRegistry, Registry, Tags, Timer};
use hourglass::{
    App, BoxFuture, ChainError, Deferred, Exchange, HandlerError, Method, RecordError, Request,
    Response, Route, Router, StatusCode,
};

const METRIC: &str = "http.server.requests";

// ── Fixtures ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct IllegalStateException(&'static str);

#[derive(Debug, thiserror::Error)]
#[error("upstream timed out")]
struct Timeout;

/// What a probe saw on one pass.
#[derive(Default)]
struct Seen {
    contexts: Vec<Arc<TimingContext>>,
    errors: Vec<(String, bool)>,
    passes: usize,
}

/// Records the timing context it finds and any error coming back up.
#[derive(Clone, Default)]
struct Probe(Arc<Mutex<Seen>>);

impl Probe {
    fn seen(&self) -> std::sync::MutexGuard<'_, Seen> {
        self.0.lock().unwrap()
    }
}

impl Middleware for Probe {
    fn handle<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), ChainError>> {
        Box::pin(async move {
            {
                let mut seen = self.seen();
                seen.passes += 1;
                if let Some(ctx) = exchange.timing() {
                    seen.contexts.push(Arc::clone(ctx));
                }
            }
            let result = next.run(exchange).await;
            if let Err(e) = &result {
                self.seen().errors.push((e.class().to_owned(), matches!(e, ChainError::Nested(_))));
            }
            result
        })
    }
}

/// Wraps every error from below in one layer of indirection.
struct WrapErrors;

impl Middleware for WrapErrors {
    fn handle<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), ChainError>> {
        Box::pin(async move { next.run(exchange).await.map_err(ChainError::nested) })
    }
}

async fn get_order(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}"}}"#).into_bytes())
}

async fn boom(_req: Request) -> Result<Response, IllegalStateException> {
    Err(IllegalStateException("x"))
}

async fn conflict(_req: Request) -> Result<Response, HandlerError> {
    Err(HandlerError::new(IllegalStateException("taken")).with_status(StatusCode::CONFLICT))
}

async fn accept_later(_req: Request) -> Deferred {
    Deferred::new(async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        StatusCode::ACCEPTED
    })
}

async fn three_hops(_req: Request) -> Deferred {
    Deferred::new(async {
        Deferred::new(async { Deferred::new(async { StatusCode::ACCEPTED }) })
    })
}

async fn times_out_later(_req: Request) -> Deferred {
    Deferred::new(async {
        Err::<Response, _>(HandlerError::new(Timeout).with_status(StatusCode::SERVICE_UNAVAILABLE))
    })
}

async fn panics_later(_req: Request) -> Deferred {
    Deferred::new(async {
        if true {
            panic!("worker died");
        }
        StatusCode::OK
    })
}

fn router() -> Router {
    Router::new()
        .route(Route::new(Method::GET, "/orders/{id}", get_order).name("OrdersController#get"))
        .route(Route::new(Method::GET, "/boom", boom).name("BoomController#get"))
        .route(Route::new(Method::POST, "/orders", conflict))
        .route(Route::new(Method::POST, "/exports", accept_later))
        .route(Route::new(Method::POST, "/pipeline", three_hops))
        .route(Route::new(Method::GET, "/slow", times_out_later))
        .route(Route::new(Method::GET, "/crash", panics_later))
        .route(Route::new(Method::GET, "/healthz", get_order).timed(Timed::disabled()))
}

/// `outer` sees what comes out of the timing middleware; `inner` sees what
/// the timing middleware stored on the exchange.
struct Harness {
    app: App,
    registry: Arc<InMemoryRegistry>,
    outer: Probe,
    inner: Probe,
}

fn harness() -> Harness {
    let registry = Arc::new(InMemoryRegistry::new());
    let outer = Probe::default();
    let inner = Probe::default();
    let app = App::new(router())
        .layer(outer.clone())
        .layer(TimingMiddleware::new(registry.clone()))
        .layer(inner.clone());
    Harness { app, registry, outer, inner }
}

fn request(method: Method, uri: &str) -> Request {
    Request::builder()
        .method(method)
        .uri(uri)
        .remote_addr("10.0.0.7:51000".parse().unwrap())
        .build()
}

fn only_timer(registry: &InMemoryRegistry) -> Tags {
    let timers = registry.find(METRIC);
    assert_eq!(timers.len(), 1, "expected exactly one timer, got {timers:?}");
    let (tags, stats) = timers.into_iter().next().unwrap();
    assert_eq!(stats.count, 1);
    tags
}

// ── Synchronous completion ───────────────────────────────────────────────────

#[tokio::test]
async fn completed_request_is_timed_once_with_outcome_tags() {
    let h = harness();
    let res = h.app.handle(request(Method::GET, "/orders/42")).await;

    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(h.registry.started(), 1);
    assert_eq!(h.registry.recorded(), 1);

    let tags = only_timer(&h.registry);
    assert_eq!(tags.get("outcome"), Some("COMPLETED"));
    assert_eq!(tags.get("status"), Some("200"));
    assert_eq!(tags.get("exception"), Some("none"));
    assert_eq!(tags.get("handler"), Some("OrdersController#get"));
    assert_eq!(tags.get("uri"), Some("/orders/{id}"));
    assert_eq!(tags.get("method"), Some("GET"));
}

#[tokio::test]
async fn timing_context_records_the_final_response() {
    let h = harness();
    h.app.handle(request(Method::GET, "/orders/42")).await;

    let seen = h.inner.seen();
    let ctx = &seen.contexts[0];
    assert!(ctx.is_finished());
    let response = ctx.handler_context().response().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.error, None);
}

#[tokio::test]
async fn unmatched_request_is_timed_with_placeholders() {
    let h = harness();
    let res = h.app.handle(request(Method::GET, "/nowhere")).await;

    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    let tags = only_timer(&h.registry);
    assert_eq!(tags.get("uri"), Some("NOT_FOUND"));
    assert_eq!(tags.get("handler"), Some("none"));
    assert_eq!(tags.get("outcome"), Some("COMPLETED"));
}

// ── Errors raised synchronously ──────────────────────────────────────────────

#[tokio::test]
async fn raised_error_is_tagged_and_propagated_unchanged() {
    let h = harness();
    let res = h.app.handle(request(Method::GET, "/boom")).await;

    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.outer.seen().errors, vec![("IllegalStateException".to_owned(), false)]);

    let tags = only_timer(&h.registry);
    assert_eq!(tags.get("exception"), Some("IllegalStateException"));
    assert_eq!(tags.get("outcome"), Some("UNHANDLED_EXCEPTION"));
    assert_eq!(tags.get("status"), Some("500"));
}

#[tokio::test]
async fn mapped_error_status_is_not_overwritten() {
    let h = harness();
    let res = h.app.handle(request(Method::POST, "/orders")).await;

    assert_eq!(res.status_code(), StatusCode::CONFLICT);
    let tags = only_timer(&h.registry);
    assert_eq!(tags.get("status"), Some("409"));
    assert_eq!(tags.get("family"), Some("CLIENT_ERROR"));
    assert_eq!(tags.get("outcome"), Some("UNHANDLED_EXCEPTION"));
}

#[tokio::test]
async fn one_layer_of_wrapping_is_looked_through() {
    let registry = Arc::new(InMemoryRegistry::new());
    let outer = Probe::default();
    let app = App::new(router())
        .layer(outer.clone())
        .layer(TimingMiddleware::new(registry.clone()))
        .layer(WrapErrors);

    let res = app.handle(request(Method::GET, "/boom")).await;

    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    let tags = only_timer(&registry);
    assert_eq!(tags.get("exception"), Some("IllegalStateException"));
    // The wrapper itself is what comes back out.
    assert_eq!(outer.seen().errors, vec![("NestedChainError".to_owned(), true)]);
}

#[tokio::test]
async fn only_one_layer_is_unwrapped() {
    let registry = Arc::new(InMemoryRegistry::new());
    let app = App::new(router())
        .layer(TimingMiddleware::new(registry.clone()))
        .layer(WrapErrors)
        .layer(WrapErrors);

    app.handle(request(Method::GET, "/boom")).await;

    let tags = only_timer(&registry);
    assert_eq!(tags.get("exception"), Some("NestedChainError"));
}

#[tokio::test]
async fn instrumentation_does_not_change_what_the_client_sees() {
    let plain = App::new(router());
    let timed = harness();

    for (method, uri) in [
        (Method::GET, "/orders/42"),
        (Method::GET, "/boom"),
        (Method::POST, "/orders"),
        (Method::GET, "/nowhere"),
        (Method::POST, "/exports"),
        (Method::GET, "/slow"),
    ] {
        let a = plain.handle(request(method.clone(), uri)).await;
        let b = timed.app.handle(request(method.clone(), uri)).await;
        assert_eq!(a.status_code(), b.status_code(), "{method} {uri}");
        assert_eq!(a.body(), b.body(), "{method} {uri}");
    }
}

// ── Asynchronous continuation ────────────────────────────────────────────────

#[tokio::test]
async fn deferred_request_is_started_and_stopped_once() {
    let h = harness();
    let res = h.app.handle(request(Method::POST, "/exports")).await;

    assert_eq!(res.status_code(), StatusCode::ACCEPTED);
    assert_eq!(h.registry.started(), 1);
    assert_eq!(h.registry.recorded(), 1);
    assert_eq!(only_timer(&h.registry).get("status"), Some("202"));

    let seen = h.inner.seen();
    assert_eq!(seen.passes, 2);
    assert!(Arc::ptr_eq(&seen.contexts[0], &seen.contexts[1]));
    assert!(seen.contexts[0].is_finished());
}

#[tokio::test]
async fn repeated_deferral_reuses_the_same_context() {
    let h = harness();
    let res = h.app.handle(request(Method::POST, "/pipeline")).await;

    assert_eq!(res.status_code(), StatusCode::ACCEPTED);
    assert_eq!(h.registry.started(), 1);
    assert_eq!(h.registry.recorded(), 1);

    let seen = h.inner.seen();
    assert_eq!(seen.passes, 4);
    let first = &seen.contexts[0];
    assert!(seen.contexts.iter().all(|ctx| Arc::ptr_eq(ctx, first)));
}

#[tokio::test]
async fn captured_failure_is_tagged_but_not_raised() {
    let h = harness();
    let res = h.app.handle(request(Method::GET, "/slow")).await;

    assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.outer.seen().errors.is_empty());

    let tags = only_timer(&h.registry);
    assert_eq!(tags.get("outcome"), Some("COMPLETED_WITH_HANDLER_EXCEPTION"));
    assert_eq!(tags.get("exception"), Some("Timeout"));
    assert_eq!(tags.get("status"), Some("503"));
}

#[tokio::test]
async fn panic_in_deferred_work_is_rendered_and_timed() {
    let h = harness();
    let res = h.app.handle(request(Method::GET, "/crash")).await;

    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    let tags = only_timer(&h.registry);
    assert_eq!(tags.get("exception"), Some("Panic"));
    assert_eq!(tags.get("outcome"), Some("COMPLETED_WITH_HANDLER_EXCEPTION"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deferred_requests_are_each_timed_once() {
    let h = Arc::new(harness());
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                let uri = if i % 2 == 0 { "/exports" } else { "/pipeline" };
                h.app.handle(request(Method::POST, uri)).await.status_code()
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::ACCEPTED);
    }
    assert_eq!(h.registry.started(), 32);
    assert_eq!(h.registry.recorded(), 32);
}

// ── Per-route configuration ──────────────────────────────────────────────────

#[tokio::test]
async fn disabled_route_records_nothing_but_still_finishes() {
    let h = harness();
    let res = h.app.handle(request(Method::GET, "/healthz")).await;

    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(h.registry.started(), 1);
    assert_eq!(h.registry.recorded(), 0);
    assert!(h.inner.seen().contexts[0].is_finished());
}

#[tokio::test]
async fn auto_timer_off_only_times_declared_routes() {
    let registry = Arc::new(InMemoryRegistry::new());
    let router = Router::new()
        .route(Route::new(Method::GET, "/orders/{id}", get_order))
        .route(
            Route::new(Method::GET, "/reports/{id}", get_order)
                .timed(Timed::new().name("reports").tag("tier", "batch"))
                .timed(Timed::new()),
        );
    let app = App::new(router).layer(
        TimingMiddleware::builder(registry.clone())
            .auto_time(AutoTimer::DISABLED)
            .build(),
    );

    app.handle(request(Method::GET, "/orders/1")).await;
    assert_eq!(registry.recorded(), 0);

    app.handle(request(Method::GET, "/reports/1")).await;
    assert_eq!(registry.started(), 2);
    assert_eq!(registry.recorded(), 2);
    let (reports, _) = registry.find("reports").into_iter().next().unwrap();
    assert_eq!(reports.get("tier"), Some("batch"));
    assert_eq!(registry.find(METRIC).len(), 1);
}

#[tokio::test]
async fn custom_metric_name() {
    let registry = Arc::new(InMemoryRegistry::new());
    let app = App::new(router()).layer(
        TimingMiddleware::builder(registry.clone())
            .metric_name("api.requests")
            .build(),
    );
    app.handle(request(Method::GET, "/orders/42")).await;
    assert_eq!(registry.find("api.requests").len(), 1);
    assert!(registry.find(METRIC).is_empty());
}

// ── Instrumentation failures ─────────────────────────────────────────────────

#[derive(Default)]
struct Refusing {
    started: AtomicU64,
}

impl Registry for Refusing {
    fn sample_started(&self, _context: &HandlerContext) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, _: &Timer, _: Duration, _: &HandlerContext) -> Result<(), RecordError> {
        Err(RecordError::Unavailable("backend down".into()))
    }
}

struct Exploding;

impl TagsProvider for Exploding {
    fn tags(&self, _: &Exchange, _: Option<&Route>, _: &Outcome<'_>) -> Tags {
        panic!("tags provider bug");
    }
}

#[tokio::test]
async fn registry_failure_does_not_touch_the_response() {
    let registry = Arc::new(Refusing::default());
    let outer = Probe::default();
    let app = App::new(router())
        .layer(outer.clone())
        .layer(TimingMiddleware::new(registry.clone()));

    let ok = app.handle(request(Method::GET, "/orders/42")).await;
    assert_eq!(ok.status_code(), StatusCode::OK);

    let failed = app.handle(request(Method::GET, "/boom")).await;
    assert_eq!(failed.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(outer.seen().errors, vec![("IllegalStateException".to_owned(), false)]);
    assert_eq!(registry.started.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn panicking_tags_provider_is_contained() {
    let registry = Arc::new(InMemoryRegistry::new());
    let inner = Probe::default();
    let app = App::new(router())
        .layer(TimingMiddleware::builder(registry.clone()).tags_provider(Exploding).build())
        .layer(inner.clone());

    let res = app.handle(request(Method::GET, "/orders/42")).await;

    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(registry.recorded(), 0);
    assert!(inner.seen().contexts[0].is_finished());
}

struct PanickingRegistry;

impl Registry for PanickingRegistry {
    fn record(&self, _: &Timer, _: Duration, _: &HandlerContext) -> Result<(), RecordError> {
        panic!("registry bug");
    }
}

#[tokio::test]
async fn panicking_registry_is_contained() {
    let inner = Probe::default();
    let app = Arc::new(
        App::new(router())
            .layer(TimingMiddleware::new(Arc::new(PanickingRegistry)))
            .layer(inner.clone()),
    );

    let served = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.handle(request(Method::GET, "/orders/42")).await.status_code() }
    })
    .await;

    assert_eq!(served.ok(), Some(StatusCode::OK));
    assert!(inner.seen().contexts[0].is_finished());
}

/// Fails on the way out whenever the request was left waiting on deferred work.
struct GivesUpOnDeferral;

impl Middleware for GivesUpOnDeferral {
    fn handle<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), ChainError>> {
        Box::pin(async move {
            next.run(exchange).await?;
            if exchange.is_async_started() {
                return Err(ChainError::from(HandlerError::named("GatewayGaveUp", "not waiting")));
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn outer_error_after_deferral_stops_the_open_sample() {
    let registry = Arc::new(InMemoryRegistry::new());
    let inner = Probe::default();
    let app = App::new(router())
        .layer(GivesUpOnDeferral)
        .layer(TimingMiddleware::new(registry.clone()))
        .layer(inner.clone());

    let res = app.handle(request(Method::POST, "/exports")).await;

    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(registry.started(), 1);
    assert_eq!(registry.recorded(), 0);
    let seen = inner.seen();
    assert_eq!(seen.passes, 1);
    assert!(seen.contexts[0].is_finished());
}
