//! Outcome classification and tag resolution.

use http::StatusCode;

use crate::error::{ChainError, HandlerError};
use crate::exchange::Exchange;
use crate::router::Route;
use crate::timer::Tags;

/// Placeholder for a tag whose value is absent.
pub const NONE: &str = "none";

/// How an exchange failed, classified once at the boundary.
#[derive(Clone, Copy, Debug)]
pub enum Failure<'e> {
    /// Deferred work failed and the dispatcher already rendered it.
    Captured(&'e HandlerError),
    /// The chain returned an error. `error` is the cause after one layer of
    /// wrapping was peeled off; `wrapped` says whether there was one.
    Raised { error: &'e ChainError, wrapped: bool },
}

impl<'e> Failure<'e> {
    pub fn raised(err: &'e ChainError) -> Self {
        let cause = err.unwrap_nested();
        Self::Raised { error: cause, wrapped: !std::ptr::eq(cause, err) }
    }

    pub fn class(&self) -> &'e str {
        match self {
            Self::Captured(e) => e.class(),
            Self::Raised { error, .. } => error.class(),
        }
    }
}

/// How an exchange concluded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome<'e> {
    Completed { status: StatusCode },
    CompletedWithHandlerError { status: StatusCode, class: &'e str },
    UnhandledError { class: &'e str },
}

impl<'e> Outcome<'e> {
    pub fn classify(status: StatusCode, failure: Option<Failure<'e>>) -> Self {
        match failure {
            None => Self::Completed { status },
            Some(f @ Failure::Captured(_)) => {
                Self::CompletedWithHandlerError { status, class: f.class() }
            }
            Some(f @ Failure::Raised { .. }) => Self::UnhandledError { class: f.class() },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "COMPLETED",
            Self::CompletedWithHandlerError { .. } => "COMPLETED_WITH_HANDLER_EXCEPTION",
            Self::UnhandledError { .. } => "UNHANDLED_EXCEPTION",
        }
    }

    pub fn error_class(&self) -> Option<&'e str> {
        match self {
            Self::Completed { .. } => None,
            Self::CompletedWithHandlerError { class, .. } | Self::UnhandledError { class } => {
                Some(class)
            }
        }
    }
}

/// Produces the tags for one finished exchange.
///
/// Must not fail: a value that cannot be resolved gets a placeholder.
pub trait TagsProvider: Send + Sync + 'static {
    fn tags(&self, exchange: &Exchange, route: Option<&Route>, outcome: &Outcome<'_>) -> Tags;
}

/// Tags `method`, `uri`, `status`, `family`, `outcome`, `exception`, `handler`.
#[derive(Clone, Debug, Default)]
pub struct DefaultTagsProvider {
    ignore_trailing_slash: bool,
}

impl DefaultTagsProvider {
    pub fn new() -> Self { Self::default() }

    /// Report `/orders/` as `/orders`.
    pub fn ignore_trailing_slash(mut self, ignore: bool) -> Self {
        self.ignore_trailing_slash = ignore;
        self
    }

    fn uri(&self, exchange: &Exchange, route: Option<&Route>) -> String {
        if let Some(route) = route {
            let mut pattern = route.pattern();
            if self.ignore_trailing_slash && pattern.len() > 1 {
                pattern = pattern.strip_suffix('/').unwrap_or(pattern);
            }
            return if pattern.is_empty() { "root".to_owned() } else { pattern.to_owned() };
        }
        let status = exchange.status();
        if status.is_redirection() {
            return "REDIRECTION".to_owned();
        }
        if status == StatusCode::NOT_FOUND {
            return "NOT_FOUND".to_owned();
        }
        match exchange.request().path() {
            "" | "/" => "root".to_owned(),
            _ => "UNKNOWN".to_owned(),
        }
    }
}

impl TagsProvider for DefaultTagsProvider {
    fn tags(&self, exchange: &Exchange, route: Option<&Route>, outcome: &Outcome<'_>) -> Tags {
        let status = exchange.status();
        Tags::new()
            .with("method", exchange.request().method().as_str())
            .with("uri", self.uri(exchange, route))
            .with("status", status.as_str())
            .with("family", family(status))
            .with("outcome", outcome.as_str())
            .with("exception", outcome.error_class().unwrap_or(NONE))
            .with("handler", route.map_or(NONE, Route::handler_name))
    }
}

/// Status family, in the upper-case form dashboards expect.
pub fn family(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "INFORMATIONAL",
        200..=299 => "SUCCESS",
        300..=399 => "REDIRECTION",
        400..=499 => "CLIENT_ERROR",
        500..=599 => "SERVER_ERROR",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use http::Method;

    use crate::request::Request;
    use crate::response::Response;

    async fn get(_req: Request) -> Response { Response::text("") }

    fn orders_route() -> Arc<Route> {
        Arc::new(Route::new(Method::GET, "/orders/{id}/", get).name("OrdersController#get"))
    }

    #[test]
    fn completed_request_with_handler() {
        let route = orders_route();
        let exchange = Exchange::new(
            Request::builder().uri("/orders/42/").build(),
            Some(route.clone()),
        );
        let outcome = Outcome::classify(exchange.status(), None);
        let tags = DefaultTagsProvider::new().tags(&exchange, Some(&route), &outcome);

        assert_eq!(tags.get("method"), Some("GET"));
        assert_eq!(tags.get("uri"), Some("/orders/{id}/"));
        assert_eq!(tags.get("status"), Some("200"));
        assert_eq!(tags.get("family"), Some("SUCCESS"));
        assert_eq!(tags.get("outcome"), Some("COMPLETED"));
        assert_eq!(tags.get("exception"), Some("none"));
        assert_eq!(tags.get("handler"), Some("OrdersController#get"));
    }

    #[test]
    fn trailing_slash_can_be_ignored() {
        let route = orders_route();
        let exchange = Exchange::new(Request::builder().build(), Some(route.clone()));
        let outcome = Outcome::classify(exchange.status(), None);
        let tags = DefaultTagsProvider::new()
            .ignore_trailing_slash(true)
            .tags(&exchange, Some(&route), &outcome);
        assert_eq!(tags.get("uri"), Some("/orders/{id}"));
    }

    #[test]
    fn unmatched_requests_use_placeholders() {
        let mut exchange = Exchange::new(Request::builder().uri("/nope").build(), None);
        exchange.set_status(StatusCode::NOT_FOUND);
        let outcome = Outcome::classify(exchange.status(), None);
        let tags = DefaultTagsProvider::new().tags(&exchange, None, &outcome);
        assert_eq!(tags.get("uri"), Some("NOT_FOUND"));
        assert_eq!(tags.get("handler"), Some("none"));
        assert_eq!(tags.get("family"), Some("CLIENT_ERROR"));

        exchange.set_status(StatusCode::FOUND);
        let tags = DefaultTagsProvider::new().tags(&exchange, None, &outcome);
        assert_eq!(tags.get("uri"), Some("REDIRECTION"));

        exchange.set_status(StatusCode::OK);
        let tags = DefaultTagsProvider::new().tags(&exchange, None, &outcome);
        assert_eq!(tags.get("uri"), Some("UNKNOWN"));

        let root = Exchange::new(Request::builder().uri("/").build(), None);
        let tags = DefaultTagsProvider::new().tags(&root, None, &outcome);
        assert_eq!(tags.get("uri"), Some("root"));
    }

    #[test]
    fn raised_errors_are_unwrapped_once() {
        let err = ChainError::nested(HandlerError::named("IllegalStateException", "x"));
        let failure = Failure::raised(&err);
        assert!(matches!(failure, Failure::Raised { wrapped: true, .. }));

        let outcome = Outcome::classify(StatusCode::INTERNAL_SERVER_ERROR, Some(failure));
        assert_eq!(outcome, Outcome::UnhandledError { class: "IllegalStateException" });
        assert_eq!(outcome.as_str(), "UNHANDLED_EXCEPTION");
    }

    #[test]
    fn captured_errors_complete_with_handler_exception() {
        let err = HandlerError::named("Timeout", "slow upstream");
        let outcome = Outcome::classify(StatusCode::SERVICE_UNAVAILABLE, Some(Failure::Captured(&err)));
        assert_eq!(outcome.as_str(), "COMPLETED_WITH_HANDLER_EXCEPTION");
        assert_eq!(outcome.error_class(), Some("Timeout"));
    }

    #[test]
    fn families() {
        assert_eq!(family(StatusCode::CONTINUE), "INFORMATIONAL");
        assert_eq!(family(StatusCode::MOVED_PERMANENTLY), "REDIRECTION");
        assert_eq!(family(StatusCode::INTERNAL_SERVER_ERROR), "SERVER_ERROR");
    }
}
