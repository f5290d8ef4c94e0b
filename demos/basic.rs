//! Timed order API with one deferred endpoint.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/orders/42
//!   curl -X POST http://localhost:3000/orders/42/export
//!   curl http://localhost:3000/orders/0
//!   curl http://localhost:3000/healthz
//!
//! Each request logs one `request timed` event with its tags.

use std::sync::Arc;
use std::time::Duration;

use hourglass::middleware::timing::{Timed, TimingMiddleware};
use hourglass::timer::TracingRegistry;
use hourglass::{
    App, Deferred, HandlerError, Method, Request, Response, Route, Router, Server, StatusCode,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
#[error("order {0} does not exist")]
struct OrderNotFound(String);

#[tokio::main]
async fn main() -> Result<(), hourglass::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let router = Router::new()
        .route(Route::new(Method::GET, "/orders/{id}", get_order).name("OrdersController#get"))
        .route(
            Route::new(Method::POST, "/orders/{id}/export", export_order)
                .name("OrdersController#export")
                .timed(Timed::new().name("orders.export").tag("tier", "batch")),
        )
        .route(Route::new(Method::GET, "/healthz", healthz).timed(Timed::disabled()));

    let app = App::new(router).layer(TimingMiddleware::new(Arc::new(TracingRegistry)));

    Server::bind("0.0.0.0:3000")?.serve(app).await
}

// GET /orders/{id}; id 0 does not exist.
async fn get_order(req: Request) -> Result<Response, HandlerError> {
    let id = req.param("id").unwrap_or("unknown");
    if id == "0" {
        return Err(HandlerError::new(OrderNotFound(id.to_owned())).with_status(StatusCode::NOT_FOUND));
    }
    Ok(Response::json(format!(r#"{{"id":"{id}","state":"shipped"}}"#).into_bytes()))
}

// POST /orders/{id}/export: answers once the export has been queued.
async fn export_order(_req: Request) -> Deferred {
    Deferred::new(async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        StatusCode::ACCEPTED
    })
}

async fn healthz(_req: Request) -> &'static str {
    "ok"
}
