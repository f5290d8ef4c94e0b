//! Per-request state shared by every stage of the middleware chain.
//!
//! An [`Exchange`] is created once per logical request and handed by
//! `&mut` to each middleware in turn. When a handler defers its work, the
//! same exchange is kept alive and passed through the chain again once the
//! work finishes; anything a middleware stored on it the first time is still
//! there the second time.

use std::sync::{Arc, Mutex, PoisonError};

use http::StatusCode;
use tracing::Span;

use crate::error::HandlerError;
use crate::handler::{Deferred, Reply};
use crate::middleware::timing::TimingContext;
use crate::request::Request;
use crate::response::Response;
use crate::router::Route;

/// Why the exchange is going through the chain this time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchKind {
    /// First pass, straight from the wire.
    Request,
    /// A later pass, after deferred work finished.
    Async,
}

#[derive(Default)]
struct Continuation {
    /// Work handed off by the handler, not yet run.
    pending: Option<Deferred>,
    /// What that work produced, applied on the next pass.
    resumed: Option<Reply>,
}

pub struct Exchange {
    request: Request,
    route: Option<Arc<Route>>,
    response: Response,
    kind: DispatchKind,
    // `Deferred` is not `Sync`; middleware futures may hold `&Exchange`
    // across an await.
    continuation: Mutex<Continuation>,
    error: Option<HandlerError>,
    timing: Option<Arc<TimingContext>>,
}

impl Exchange {
    /// A fresh exchange for `request`, matched to `route` if any.
    ///
    /// The response starts out as an empty `200 OK`.
    pub fn new(request: Request, route: Option<Arc<Route>>) -> Self {
        Self {
            request,
            route,
            response: Response::status(StatusCode::OK),
            kind: DispatchKind::Request,
            continuation: Mutex::default(),
            error: None,
            timing: None,
        }
    }

    pub fn request(&self) -> &Request { &self.request }

    /// The route the request matched, or `None` when nothing did.
    pub fn route(&self) -> Option<&Arc<Route>> { self.route.as_ref() }

    pub fn dispatch_kind(&self) -> DispatchKind { self.kind }

    // ── Response ─────────────────────────────────────────────────────────────

    pub fn response(&self) -> &Response { &self.response }

    pub fn status(&self) -> StatusCode { self.response.status }

    pub fn set_status(&mut self, status: StatusCode) {
        self.response.status = status;
    }

    pub fn set_response(&mut self, response: Response) {
        self.response = response;
    }

    pub(crate) fn into_response(self) -> Response {
        self.response
    }

    // ── Asynchronous continuation ────────────────────────────────────────────

    /// True while deferred work is waiting to run. The current pass through
    /// the chain will not produce the final response.
    pub fn is_async_started(&self) -> bool {
        self.continuation.lock().unwrap_or_else(PoisonError::into_inner).pending.is_some()
    }

    pub(crate) fn start_async(&mut self, work: Deferred) {
        self.continuation_mut().pending = Some(work);
    }

    pub(crate) fn take_pending(&mut self) -> Option<Deferred> {
        self.continuation_mut().pending.take()
    }

    /// Switches to an async pass. `reply` is what the endpoint applies on
    /// that pass; `None` when the dispatcher already rendered the result.
    pub(crate) fn resume(&mut self, reply: Option<Reply>) {
        self.kind = DispatchKind::Async;
        self.continuation_mut().resumed = reply;
    }

    pub(crate) fn take_resumed(&mut self) -> Option<Reply> {
        self.continuation_mut().resumed.take()
    }

    fn continuation_mut(&mut self) -> &mut Continuation {
        self.continuation.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Out-of-band error capture ────────────────────────────────────────────

    /// Error from deferred work that the dispatcher already rendered.
    pub fn error(&self) -> Option<&HandlerError> { self.error.as_ref() }

    pub(crate) fn stash_error(&mut self, err: HandlerError) {
        self.error = Some(err);
    }

    // ── Timing context store ─────────────────────────────────────────────────

    pub fn timing(&self) -> Option<&Arc<TimingContext>> { self.timing.as_ref() }

    /// Attaches the timing context for this exchange.
    ///
    /// Attaching twice is a bug in the caller; the second context is dropped
    /// and the first one kept.
    pub fn attach_timing(&mut self, context: Arc<TimingContext>) {
        debug_assert!(self.timing.is_none(), "timing context attached twice");
        if self.timing.is_none() {
            self.timing = Some(context);
        }
    }

    /// Span of the timed exchange, for stages that want to log inside it.
    pub fn span(&self) -> Option<&Span> {
        self.timing.as_deref().map(TimingContext::span)
    }
}
