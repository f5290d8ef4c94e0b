//! Timer primitive: samples, scopes, and the registries that record them.
//!
//! A [`Sample`] is started once per exchange and stopped once. Stopping
//! records the elapsed time into zero or more [`Timer`]s on a [`Registry`].
//! Stopping with no timers is the "record nothing" case: the sample is
//! finished but no measurement is kept.
//!
//! ```text
//! Sample::start(registry, ctx) ── make_current() ──► Scope
//!        │                                             │
//!        └── stop(&[Timer]) ◄──────────── close() ─────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use tracing::{Span, info, info_span, warn};

use crate::error::RecordError;
use crate::request::Request;

// ── Tags ─────────────────────────────────────────────────────────────────────

/// Label set attached to a timer. Keys are unique; inserting an existing key
/// replaces its value.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn extend(&mut self, other: &Tags) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ── Timer ────────────────────────────────────────────────────────────────────

/// Identity of one timer a sample is recorded into.
#[derive(Clone, Debug, PartialEq)]
pub struct Timer {
    pub name: String,
    pub tags: Tags,
    pub description: Option<String>,
}

impl Timer {
    pub fn builder(name: impl Into<String>) -> TimerBuilder {
        TimerBuilder { name: name.into(), tags: Tags::new(), description: None }
    }
}

pub struct TimerBuilder {
    name: String,
    tags: Tags,
    description: Option<String>,
}

impl TimerBuilder {
    pub fn tags(mut self, tags: &Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn build(self) -> Timer {
        Timer { name: self.name, tags: self.tags, description: self.description }
    }
}

// ── HandlerContext ───────────────────────────────────────────────────────────

/// Request metadata captured when a sample starts.
///
/// Captured once, up front, so later stages mutating the exchange cannot
/// change what the measurement is attributed to. The response side is
/// filled in once, when the sample is stopped.
#[derive(Debug)]
pub struct HandlerContext {
    pub method: Method,
    pub scheme: String,
    pub host: Option<String>,
    pub target: String,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    response: OnceLock<ResponseMeta>,
}

/// Response-side metadata, known only when the exchange finishes.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub error: Option<String>,
}

impl HandlerContext {
    pub fn from_request(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            scheme: req.scheme().to_owned(),
            host: req.host().map(str::to_owned),
            target: req.target().to_owned(),
            remote_addr: req.remote_addr(),
            local_addr: req.local_addr(),
            response: OnceLock::new(),
        }
    }

    /// Records the response side. Only the first call has any effect.
    pub fn set_response(&self, meta: ResponseMeta) {
        let _ = self.response.set(meta);
    }

    pub fn response(&self) -> Option<&ResponseMeta> {
        self.response.get()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Sink for finished measurements.
///
/// Shared across every request; implementations synchronise themselves.
pub trait Registry: Send + Sync + 'static {
    /// Called once when a sample starts.
    fn sample_started(&self, _context: &HandlerContext) {}

    /// Records one measurement into `timer`.
    fn record(
        &self,
        timer: &Timer,
        elapsed: Duration,
        context: &HandlerContext,
    ) -> Result<(), RecordError>;
}

// ── Sample / Scope ───────────────────────────────────────────────────────────

/// A started timer. Consumed by [`Sample::stop`], so it cannot be stopped twice.
pub struct Sample {
    started: Instant,
    registry: Arc<dyn Registry>,
    context: Arc<HandlerContext>,
}

impl Sample {
    pub fn start(registry: Arc<dyn Registry>, context: Arc<HandlerContext>) -> Self {
        if catch_unwind(AssertUnwindSafe(|| registry.sample_started(&context))).is_err() {
            warn!("timer registry panicked while starting a sample");
        }
        Self { started: Instant::now(), registry, context }
    }

    /// Activates this sample for the stages that run after it.
    ///
    /// The returned scope carries the exchange's span; it is handed to later
    /// stages explicitly, never through thread-local state.
    pub fn make_current(&self) -> Scope {
        let span = info_span!(
            "http.server.request",
            method = %self.context.method,
            target = %self.context.target,
            remote = ?self.context.remote_addr,
        );
        Scope { span }
    }

    pub fn context(&self) -> &Arc<HandlerContext> { &self.context }

    /// Stops the sample and records the elapsed time into every timer.
    ///
    /// Every timer is attempted even if an earlier one fails; the first
    /// failure is returned.
    pub fn stop(self, timers: &[Timer]) -> Result<Duration, RecordError> {
        let elapsed = self.started.elapsed();
        let mut first_err = None;
        for timer in timers {
            if let Err(e) = self.registry.record(timer, elapsed, &self.context) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(elapsed),
        }
    }
}

/// Activation handle for a sample. Closed exactly once, by value.
pub struct Scope {
    span: Span,
}

impl Scope {
    pub fn span(&self) -> &Span { &self.span }

    pub fn close(self) {
        drop(self.span);
    }
}

// ── InMemoryRegistry ─────────────────────────────────────────────────────────

/// Aggregated statistics for one timer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimerStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimerStats {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Keeps count, total and max per timer in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    started: AtomicU64,
    timers: RwLock<HashMap<(String, Tags), TimerStats>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self { Self::default() }

    /// Number of samples started so far.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Every timer recorded under `name`, with its tags.
    pub fn find(&self, name: &str) -> Vec<(Tags, TimerStats)> {
        let timers = self.timers.read().unwrap_or_else(PoisonError::into_inner);
        timers.iter()
            .filter(|((n, _), _)| n == name)
            .map(|((_, tags), stats)| (tags.clone(), *stats))
            .collect()
    }

    /// Total measurements recorded across all timers.
    pub fn recorded(&self) -> u64 {
        let timers = self.timers.read().unwrap_or_else(PoisonError::into_inner);
        timers.values().map(|s| s.count).sum()
    }
}

impl Registry for InMemoryRegistry {
    fn sample_started(&self, _context: &HandlerContext) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn record(
        &self,
        timer: &Timer,
        elapsed: Duration,
        _context: &HandlerContext,
    ) -> Result<(), RecordError> {
        let mut timers = self.timers.write().unwrap_or_else(PoisonError::into_inner);
        timers
            .entry((timer.name.clone(), timer.tags.clone()))
            .or_default()
            .record(elapsed);
        Ok(())
    }
}

// ── TracingRegistry ──────────────────────────────────────────────────────────

/// Emits one structured `info` event per measurement and keeps nothing.
#[derive(Debug, Default)]
pub struct TracingRegistry;

impl Registry for TracingRegistry {
    fn record(
        &self,
        timer: &Timer,
        elapsed: Duration,
        context: &HandlerContext,
    ) -> Result<(), RecordError> {
        let status = context.response().map(|r| r.status.as_u16());
        info!(
            timer = %timer.name,
            tags = %timer.tags,
            description = timer.description.as_deref(),
            elapsed_us = elapsed.as_micros() as u64,
            method = %context.method,
            target = %context.target,
            status,
            "request timed"
        );
        Ok(())
    }
}
