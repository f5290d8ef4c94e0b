//! # hourglass
//!
//! A small HTTP framework whose one job beyond routing is to time every
//! request correctly, including requests that hand their work off to the
//! background and answer later.
//!
//! ## The contract
//!
//! Every request is measured from the moment it enters the timing
//! middleware until its *final* outcome is known. A request that defers its
//! work passes through the middleware stack more than once; it is still
//! started once and stopped once. The measurement never changes what the
//! client sees: same status, same error, with or without instrumentation.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hourglass::{App, Deferred, Method, Request, Response, Route, Router, Server, StatusCode};
//! use hourglass::middleware::timing::{Timed, TimingMiddleware};
//! use hourglass::timer::TracingRegistry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hourglass::Error> {
//!     let router = Router::new()
//!         .route(Route::new(Method::GET, "/orders/{id}", get_order).name("OrdersController#get"))
//!         .route(Route::new(Method::POST, "/exports", export).timed(Timed::new().name("exports")));
//!
//!     let app = App::new(router).layer(TimingMiddleware::new(Arc::new(TracingRegistry)));
//!
//!     Server::bind("0.0.0.0:3000")?.serve(app).await
//! }
//!
//! async fn get_order(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#).into_bytes())
//! }
//!
//! async fn export(_req: Request) -> Deferred {
//!     Deferred::new(async { StatusCode::ACCEPTED })
//! }
//! ```

mod app;
mod error;
mod exchange;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod middleware;
pub mod timer;
pub mod uri;

pub use app::App;
pub use error::{ChainError, Error, HandlerError, RecordError};
pub use exchange::{DispatchKind, Exchange};
pub use handler::{BoxFuture, Deferred, Handler, IntoReply, Reply};
pub use http::{Method, StatusCode};
pub use request::{Request, RequestBuilder};
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{Route, Router};
pub use server::Server;
