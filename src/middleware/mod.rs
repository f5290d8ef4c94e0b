//! Middleware layer.
//!
//! Middleware intercepts every pass of an [`Exchange`] through the stack and
//! is the right place for cross-cutting concerns: timing, request-id
//! injection, authentication-header inspection.
//!
//! ```text
//! App::handle ──► mw[0] ──► mw[1] ──► … ──► endpoint (handler or resumed reply)
//!                   ▲         ▲                         │
//!                   └─────────┴──── Result<(), ChainError>
//! ```
//!
//! A middleware may run more than once for the same request: when a handler
//! defers its work, the exchange goes through the whole stack again once the
//! work finishes. Check [`Exchange::dispatch_kind`] or keep state on the
//! exchange if that matters.
//!
//! Built-in middleware:
//! - [`timing`]: per-exchange latency measurement with outcome tags

pub mod timing;

use std::sync::Arc;

use http::StatusCode;

use crate::error::ChainError;
use crate::exchange::{DispatchKind, Exchange};
use crate::handler::{BoxFuture, Reply};
use crate::response::Response;

/// One stage of the processing chain.
///
/// ```rust
/// use hourglass::{BoxFuture, ChainError, Exchange};
/// use hourglass::middleware::{Middleware, Next};
///
/// struct PoweredBy;
///
/// impl Middleware for PoweredBy {
///     fn handle<'a>(
///         &'a self,
///         exchange: &'a mut Exchange,
///         next: Next<'a>,
///     ) -> BoxFuture<'a, Result<(), ChainError>> {
///         Box::pin(async move {
///             next.run(exchange).await?;
///             tracing::debug!(status = %exchange.status(), "served");
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    /// Handles one pass of `exchange`. Call `next.run(exchange)` at most once
    /// to continue down the chain.
    fn handle<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), ChainError>>;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { rest: chain }
    }

    pub async fn run(self, exchange: &mut Exchange) -> Result<(), ChainError> {
        match self.rest.split_first() {
            Some((first, rest)) => first.handle(exchange, Next { rest }).await,
            None => endpoint(exchange).await,
        }
    }
}

/// End of the chain.
///
/// On the first pass it calls the matched handler (404 if none matched). On
/// a later pass it applies whatever the deferred work produced.
async fn endpoint(exchange: &mut Exchange) -> Result<(), ChainError> {
    let reply = match exchange.dispatch_kind() {
        DispatchKind::Request => {
            let Some(route) = exchange.route().cloned() else {
                exchange.set_response(Response::status(StatusCode::NOT_FOUND));
                return Ok(());
            };
            let request = exchange.request().clone();
            route.handler().call(request).await
        }
        DispatchKind::Async => match exchange.take_resumed() {
            Some(reply) => reply,
            // Already rendered by the dispatcher.
            None => return Ok(()),
        },
    };

    match reply {
        Reply::Ready(Ok(response)) => {
            exchange.set_response(response);
            Ok(())
        }
        Reply::Ready(Err(err)) => {
            if let Some(status) = err.status() {
                exchange.set_status(status);
            }
            Err(err.into())
        }
        Reply::Deferred(work) => {
            exchange.start_async(work);
            Ok(())
        }
    }
}
