//! Test doubles for running components without a NATS server.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-dcron = { path = "...", features = ["test-support"] }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::span::Attributes;
use tracing::{Event, Id, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

use crate::publish::MSG_ID_HEADER;
use crate::traits::{LockClient, TickPublisher};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct MockError(pub &'static str);

// ── MockLock ─────────────────────────────────────────────────────────────────

const ACQUIRE_POLL: Duration = Duration::from_millis(10);

struct Holder {
    owner: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct Store {
    holders: Mutex<HashMap<String, Holder>>,
    next_owner: AtomicU64,
}

#[derive(Default)]
struct Script {
    failing_acquires: AtomicUsize,
    deny_acquire: AtomicBool,
    deny_refresh: AtomicBool,
    stall_refresh: AtomicBool,
    deny_release: AtomicBool,
    stall_release: AtomicBool,
    acquire_attempts: AtomicUsize,
    refreshes: AtomicUsize,
    releases: AtomicUsize,
}

/// In-memory lock with mutual exclusion and TTL expiry.
///
/// Clones share everything and act as the same owner. [`MockLock::replica`]
/// returns a handle on the same store with a different owner, standing in
/// for another process of the same component.
#[derive(Clone)]
pub struct MockLock {
    owner: u64,
    store: Arc<Store>,
    script: Arc<Script>,
}

impl Default for MockLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLock {
    pub fn new() -> Self {
        let store = Arc::new(Store::default());
        let owner = store.next_owner.fetch_add(1, Ordering::SeqCst);
        Self {
            owner,
            store,
            script: Arc::new(Script::default()),
        }
    }

    pub fn replica(&self) -> Self {
        Self {
            owner: self.store.next_owner.fetch_add(1, Ordering::SeqCst),
            store: Arc::clone(&self.store),
            script: Arc::new(Script::default()),
        }
    }

    /// The next `n` acquire calls fail straight away.
    pub fn fail_next_acquires(&self, n: usize) {
        self.script.failing_acquires.store(n, Ordering::SeqCst);
    }

    /// Acquire never succeeds, as if another process held the lock forever.
    pub fn deny_acquire(&self) {
        self.script.deny_acquire.store(true, Ordering::SeqCst);
    }

    pub fn allow_acquire(&self) {
        self.script.deny_acquire.store(false, Ordering::SeqCst);
    }

    pub fn deny_refresh(&self) {
        self.script.deny_refresh.store(true, Ordering::SeqCst);
    }

    /// Refresh never completes.
    pub fn stall_refresh(&self) {
        self.script.stall_refresh.store(true, Ordering::SeqCst);
    }

    pub fn deny_release(&self) {
        self.script.deny_release.store(true, Ordering::SeqCst);
    }

    /// Release never completes.
    pub fn stall_release(&self) {
        self.script.stall_release.store(true, Ordering::SeqCst);
    }

    pub fn acquire_attempts(&self) -> usize {
        self.script.acquire_attempts.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.script.refreshes.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.script.releases.load(Ordering::SeqCst)
    }

    /// Whether this handle currently holds an unexpired lock on `path`.
    pub fn holds(&self, path: &str) -> bool {
        let holders = self.store.holders.lock().unwrap();
        holders
            .get(path)
            .is_some_and(|h| h.owner == self.owner && h.expires_at > Instant::now())
    }

    /// Whether anyone holds an unexpired lock on `path`.
    pub fn is_locked(&self, path: &str) -> bool {
        let holders = self.store.holders.lock().unwrap();
        holders
            .get(path)
            .is_some_and(|h| h.expires_at > Instant::now())
    }

    fn try_take(&self, path: &str, ttl: Duration) -> bool {
        let mut holders = self.store.holders.lock().unwrap();
        let now = Instant::now();
        let taken = holders
            .get(path)
            .is_some_and(|h| h.owner != self.owner && h.expires_at > now);
        if taken {
            return false;
        }
        holders.insert(
            path.to_string(),
            Holder {
                owner: self.owner,
                expires_at: now + ttl,
            },
        );
        true
    }
}

impl LockClient for MockLock {
    type Error = MockError;

    async fn acquire(&self, path: &str, ttl: Duration) -> Result<(), MockError> {
        self.script.acquire_attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .script
            .failing_acquires
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MockError("lock store unavailable"));
        }
        loop {
            if !self.script.deny_acquire.load(Ordering::SeqCst) && self.try_take(path, ttl) {
                return Ok(());
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    async fn refresh(&self, path: &str, ttl: Duration) -> Result<(), MockError> {
        self.script.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.script.stall_refresh.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.script.deny_refresh.load(Ordering::SeqCst) {
            return Err(MockError("refresh denied"));
        }
        let mut holders = self.store.holders.lock().unwrap();
        match holders.get_mut(path) {
            Some(h) if h.owner == self.owner => {
                h.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(MockError("lock not held")),
        }
    }

    async fn release(&self, path: &str) -> Result<(), MockError> {
        self.script.releases.fetch_add(1, Ordering::SeqCst);
        if self.script.stall_release.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.script.deny_release.load(Ordering::SeqCst) {
            return Err(MockError("release denied"));
        }
        let mut holders = self.store.holders.lock().unwrap();
        match holders.get(path) {
            Some(h) if h.owner == self.owner => {
                holders.remove(path);
                Ok(())
            }
            _ => Err(MockError("lock not held")),
        }
    }
}

// ── MockTickPublisher ────────────────────────────────────────────────────────

/// Records every tick published during a test run.
#[derive(Clone, Default)]
pub struct MockTickPublisher {
    records: Arc<Mutex<Vec<PublishedTick>>>,
    fail: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct PublishedTick {
    pub subject: String,
    pub msg_id: Option<String>,
    pub payload: Vec<u8>,
}

impl MockTickPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn ticks(&self) -> Vec<PublishedTick> {
        self.records.lock().unwrap().clone()
    }

    pub fn tick_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl TickPublisher for MockTickPublisher {
    type Error = MockError;

    async fn publish_tick(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: Bytes,
    ) -> Result<(), MockError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MockError("publish failed"));
        }
        self.records.lock().unwrap().push(PublishedTick {
            subject,
            msg_id: headers.get(MSG_ID_HEADER).map(|v| v.as_str().to_string()),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

// ── LogCapture ───────────────────────────────────────────────────────────────

/// One recorded event. `fields` holds the event's fields followed by the
/// fields of its enclosing spans, innermost span last.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }
}

/// Tracing layer recording events for assertions.
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the capture as the default subscriber of the current thread.
    pub fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_at(&self, level: Level) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    pub fn count(&self, level: Level, message: &str) -> usize {
        self.events_at(level)
            .iter()
            .filter(|e| e.message == message)
            .count()
    }
}

struct SpanFields(Vec<(String, String)>);

impl<S> Layer<S> for LogCapture
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields(visitor.fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut fields = visitor.fields;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanFields(span_fields)) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.iter().cloned());
                }
            }
        }

        self.events.lock().unwrap().push(CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}
