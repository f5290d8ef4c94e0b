//! Error types.
//!
//! Three families, kept apart on purpose:
//!
//! - [`Error`]: infrastructure failures of the server itself (bind, accept).
//! - [`HandlerError`] / [`ChainError`]: failures raised while processing a
//!   request. These travel through the middleware chain and are rendered as
//!   HTTP responses at the end of it.
//! - [`RecordError`]: a timer backend refused a measurement. Instrumentation
//!   logs these and moves on; they never reach the client.

use std::fmt;

use http::StatusCode;

/// The error type returned by the server's fallible operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values or [`HandlerError`]s, not as `Error`s.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid socket address `{addr}`: {source}")]
    Addr {
        addr: String,
        source: std::net::AddrParseError,
    },
}

// ── HandlerError ─────────────────────────────────────────────────────────────

/// A failure raised by a handler.
///
/// Any `std::error::Error` converts into one, so handlers can use `?`:
///
/// ```rust
/// use hourglass::{HandlerError, Request, Response};
///
/// async fn parse(req: Request) -> Result<Response, HandlerError> {
///     let body = std::str::from_utf8(req.body())?;
///     Ok(Response::text(body.to_owned()))
/// }
/// ```
///
/// The error remembers the short type name of what it was built from
/// (`Utf8Error` above). That name is the error's *class* and is what
/// instrumentation reports in the `exception` tag.
pub struct HandlerError {
    class: String,
    message: String,
    status: Option<StatusCode>,
}

impl HandlerError {
    /// Wraps a concrete error, recording its type name as the class.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            class: short_type_name::<E>().to_owned(),
            message: err.to_string(),
            status: None,
        }
    }

    /// An error with an explicit class name and message.
    pub fn named(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self { class: class.into(), message: message.into(), status: None }
    }

    /// Maps this error to a specific response status.
    ///
    /// Without a mapping the error is rendered as `500 Internal Server Error`.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn class(&self) -> &str { &self.class }
    pub fn message(&self) -> &str { &self.message }
    pub fn status(&self) -> Option<StatusCode> { self.status }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("class", &self.class)
            .field("message", &self.message)
            .field("status", &self.status)
            .finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

// `HandlerError` deliberately does not implement `std::error::Error`: that
// would overlap with the blanket `From` below.
impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

/// `my_app::orders::OrderNotFound` -> `OrderNotFound`.
///
/// Generic arguments are left as they are.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}

// ── ChainError ───────────────────────────────────────────────────────────────

/// An error travelling back up the middleware chain.
///
/// The variants are closed: a failure is either raised directly by a handler,
/// or wrapped by a chain stage that wants to add its own context. Consumers
/// that care about the real cause look through exactly one wrapping layer
/// with [`ChainError::unwrap_nested`].
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("{0}")]
    Handler(HandlerError),

    #[error("request processing failed: {0}")]
    Nested(#[source] Box<ChainError>),
}

impl ChainError {
    /// Wraps `inner` in one layer of dispatcher indirection.
    pub fn nested(inner: impl Into<ChainError>) -> Self {
        Self::Nested(Box::new(inner.into()))
    }

    /// Peels off one layer of wrapping, if present. Never recursive.
    pub fn unwrap_nested(&self) -> &ChainError {
        match self {
            Self::Nested(cause) => cause,
            other => other,
        }
    }

    /// Class name reported for this error.
    pub fn class(&self) -> &str {
        match self {
            Self::Handler(e) => e.class(),
            Self::Nested(_) => "NestedChainError",
        }
    }

    /// Status mapped by the underlying handler error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Handler(e) => e.status(),
            Self::Nested(cause) => cause.status(),
        }
    }
}

impl From<HandlerError> for ChainError {
    fn from(err: HandlerError) -> Self {
        Self::Handler(err)
    }
}

// ── RecordError ──────────────────────────────────────────────────────────────

/// A timer backend failed to record a measurement.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("timer `{name}` rejected: {reason}")]
    Rejected { name: String, reason: String },

    #[error("timer backend unavailable: {0}")]
    Unavailable(String),
}
