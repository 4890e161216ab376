use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;

/// When a job fires next.
///
/// Implementations are pure functions of `after`, except [`ImmediatelyOnce`]
/// which is one-shot. `None` means the schedule has no future fire time.
pub trait Schedule: Send + Sync {
    fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

impl<S: Schedule + ?Sized> Schedule for Box<S> {
    fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (**self).next(after)
    }
}

impl<S: Schedule + ?Sized> Schedule for Arc<S> {
    fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (**self).next(after)
    }
}

/// A parsed cron expression evaluated in a fixed timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
    tz: Tz,
}

impl CronSchedule {
    pub(crate) fn new(expr: String, schedule: cron::Schedule, tz: Tz) -> Self {
        Self { expr, schedule, tz }
    }

    /// The expression as handed to the `cron` crate (seconds field included).
    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}

impl Schedule for CronSchedule {
    fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz);
        self.schedule
            .after(&local)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Constant-delay schedule produced by `@every <duration>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Every {
    interval: Duration,
}

impl Every {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Schedule for Every {
    fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delta = TimeDelta::from_std(self.interval).ok()?;
        after.checked_add_signed(delta)
    }
}

/// Fires at the moment the schedule is first consulted, then defers to `inner`.
///
/// The first call to [`Schedule::next`] returns `after` unchanged. Every later
/// call is answered by the wrapped schedule. The flag is claimed with a
/// compare-and-swap so concurrent callers cannot both see the first call.
pub struct ImmediatelyOnce<S> {
    inner: S,
    fired: AtomicBool,
}

impl<S: Schedule> ImmediatelyOnce<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fired: AtomicBool::new(false),
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl<S: Schedule> Schedule for ImmediatelyOnce<S> {
    fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(after);
        }
        self.inner.next(after)
    }
}
