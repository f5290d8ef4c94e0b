//! Handler trait, type erasure, and deferred replies.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* types in one table, so each is
//! hidden behind a trait object:
//!
//! ```text
//! async fn get_order(req: Request) -> Response { … }   ← user writes this
//!        ↓ Route::new(Method::GET, "/orders/{id}", get_order)
//! get_order.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(get_order))                       ← stored as BoxedHandler
//!        ↓
//! handler.call(req)  at request time                   ← one vtable dispatch
//!        ↓
//! Box::pin(async { get_order(req).await.into_reply() })
//! ```
//!
//! # Deferred replies
//!
//! A handler that cannot answer right away returns a [`Deferred`]. The
//! dispatcher then finishes the current pass through the middleware chain
//! without a response, runs the deferred work in the background, and passes
//! the exchange through the chain a second time with the result. The
//! deferred work may itself return another `Deferred`, so one request can go
//! through the chain any number of times.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Reply ────────────────────────────────────────────────────────────────────

/// What a handler produced.
pub enum Reply {
    /// The handler finished, successfully or not.
    Ready(Result<Response, HandlerError>),
    /// The handler handed off to background work.
    Deferred(Deferred),
}

/// Background work that will eventually produce another [`Reply`].
pub struct Deferred(pub(crate) BoxFuture<'static, Reply>);

impl Deferred {
    /// ```rust
    /// use hourglass::{Deferred, Request, StatusCode};
    ///
    /// async fn enqueue(_req: Request) -> Deferred {
    ///     Deferred::new(async {
    ///         // long-running work
    ///         StatusCode::ACCEPTED
    ///     })
    /// }
    /// ```
    pub fn new<F, R>(work: F) -> Self
    where
        F: Future<Output = R> + Send + 'static,
        R: IntoReply + Send + 'static,
    {
        Self(Box::pin(async move { work.await.into_reply() }))
    }
}

/// Conversion into a [`Reply`].
///
/// Implemented for every [`IntoResponse`] type shipped with the crate, for
/// `Result<T, E>` where `T: IntoResponse` and `E: Into<HandlerError>`, and for
/// [`Deferred`].
pub trait IntoReply {
    fn into_reply(self) -> Reply;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Reply { self }
}

impl IntoReply for Deferred {
    fn into_reply(self) -> Reply { Reply::Deferred(self) }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoResponse,
    E: Into<HandlerError>,
{
    fn into_reply(self) -> Reply {
        Reply::Ready(self.map(IntoResponse::into_response).map_err(Into::into))
    }
}

macro_rules! ready_reply {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoReply for $ty {
                fn into_reply(self) -> Reply { Reply::Ready(Ok(self.into_response())) }
            }
        )*
    };
}

ready_reply!(Response, &'static str, String, http::StatusCode);

// ── Internal types ───────────────────────────────────────────────────────────

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture<'static, Reply>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoReply
/// ```
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler `F` to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Reply> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_reply() })
    }
}
