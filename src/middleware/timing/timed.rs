//! Per-route timing declarations and auto-timing.

use crate::timer::{Tags, Timer};

/// Timing declaration attached to a route at registration.
///
/// ```rust
/// use hourglass::{Method, Request, Response, Route};
/// use hourglass::middleware::timing::Timed;
///
/// # async fn export(_: Request) -> Response { Response::text("") }
/// Route::new(Method::GET, "/reports/export", export)
///     .timed(Timed::new().name("reports.export").tag("tier", "batch"));
/// ```
#[derive(Clone, Debug)]
pub struct Timed {
    enabled: bool,
    name: Option<String>,
    extra_tags: Tags,
    description: Option<String>,
}

impl Timed {
    pub fn new() -> Self {
        Self { enabled: true, name: None, extra_tags: Tags::new(), description: None }
    }

    /// Opts the route out of timing. Any disabled entry switches timing off
    /// for the whole route.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::new() }
    }

    /// Metric name; defaults to the middleware's metric name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_tags.insert(key, value);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_enabled(&self) -> bool { self.enabled }
}

impl Default for Timed {
    fn default() -> Self { Self::new() }
}

/// Whether routes without a [`Timed`] declaration are timed anyway.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AutoTimer {
    enabled: bool,
}

impl AutoTimer {
    pub const ENABLED: Self = Self { enabled: true };
    pub const DISABLED: Self = Self { enabled: false };

    pub fn is_enabled(&self) -> bool { self.enabled }
}

impl Default for AutoTimer {
    fn default() -> Self { Self::ENABLED }
}

/// The timers one exchange is recorded into.
///
/// - no declarations: one timer under `metric_name` if auto-timing is on,
///   none otherwise;
/// - any declaration disabled: none;
/// - otherwise one timer per declaration, with its extra tags on top of
///   `tags`.
pub(crate) fn timers(auto: AutoTimer, metric_name: &str, declared: &[Timed], tags: &Tags) -> Vec<Timer> {
    if declared.is_empty() {
        return if auto.is_enabled() {
            vec![Timer::builder(metric_name).tags(tags).build()]
        } else {
            Vec::new()
        };
    }
    if declared.iter().any(|t| !t.enabled) {
        return Vec::new();
    }
    declared
        .iter()
        .map(|t| {
            Timer::builder(t.name.as_deref().unwrap_or(metric_name))
                .tags(tags)
                .tags(&t.extra_tags)
                .description(t.description.clone())
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Tags {
        Tags::new().with("status", "200")
    }

    #[test]
    fn undeclared_route_follows_auto_timer() {
        let on = timers(AutoTimer::ENABLED, "http.server.requests", &[], &tags());
        assert_eq!(on.len(), 1);
        assert_eq!(on[0].name, "http.server.requests");
        assert_eq!(on[0].tags.get("status"), Some("200"));

        assert!(timers(AutoTimer::DISABLED, "http.server.requests", &[], &tags()).is_empty());
    }

    #[test]
    fn declared_route_is_timed_even_without_auto_timer() {
        let declared = [Timed::new()];
        let out = timers(AutoTimer::DISABLED, "http.server.requests", &declared, &tags());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "http.server.requests");
    }

    #[test]
    fn each_declaration_yields_a_timer() {
        let declared = [
            Timed::new().name("orders.get").tag("tier", "gold").description("order lookups"),
            Timed::new().tag("status", "overridden"),
        ];
        let out = timers(AutoTimer::ENABLED, "http.server.requests", &declared, &tags());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "orders.get");
        assert_eq!(out[0].tags.get("tier"), Some("gold"));
        assert_eq!(out[0].description.as_deref(), Some("order lookups"));
        assert_eq!(out[1].tags.get("status"), Some("overridden"));
    }

    #[test]
    fn any_disabled_declaration_turns_timing_off() {
        let declared = [Timed::new().name("a"), Timed::disabled()];
        assert!(timers(AutoTimer::ENABLED, "m", &declared, &tags()).is_empty());
    }
}
