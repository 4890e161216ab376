use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::chain::Chain;
use crate::config::CronConfig;
use crate::engine::{Engine, Entry, EntryId, RunningJobs};
use crate::error::{CronError, JobError, Result};
use crate::job::{FuncJob, Job, NamedJob, WrappedJob};
use crate::parser::Parser;
use crate::schedule::{ImmediatelyOnce, Schedule};
use crate::traits::LockClient;

/// Lock client of a standalone component. Never called.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

impl LockClient for NoLock {
    type Error = std::convert::Infallible;

    async fn acquire(&self, _path: &str, _ttl: Duration) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    async fn refresh(&self, _path: &str, _ttl: Duration) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    async fn release(&self, _path: &str) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

/// A named group of cron jobs.
///
/// Standalone, [`CronComponent::start`] runs the engine right away. In
/// distributed mode every replica sharing the component name competes for
/// one lock; only the holder runs the engine, and it keeps the lock alive
/// with a background refresh until [`CronComponent::stop`].
pub struct CronComponent<L: LockClient = NoLock> {
    name: String,
    config: CronConfig,
    lock_path: String,
    engine: Arc<Engine>,
    parser: Parser,
    chain: Chain,
    names: Mutex<HashMap<String, EntryId>>,
    locker: Option<L>,
    span: Span,
    shutdown: CancellationToken,
    started: AtomicBool,
    held: Arc<AtomicBool>,
    leader: Mutex<Option<JoinHandle<()>>>,
}

impl CronComponent<NoLock> {
    /// Standalone component. Fails if `config` asks for distributed mode.
    pub fn new(name: impl Into<String>, config: CronConfig) -> Result<Self> {
        let name = name.into();
        if config.distributed_task {
            return Err(CronError::MissingLocker { name });
        }
        Ok(Self::build(name, config, None))
    }
}

impl<L: LockClient> CronComponent<L> {
    /// Component that takes `locker` before running when
    /// `config.distributed_task` is set.
    pub fn with_locker(name: impl Into<String>, config: CronConfig, locker: L) -> Self {
        Self::build(name.into(), config, Some(locker))
    }

    fn build(name: String, config: CronConfig, locker: Option<L>) -> Self {
        let span = info_span!("cron", component = %name);
        Self {
            lock_path: config.lock_path(&name),
            parser: config.parser(),
            chain: Chain::for_delay_exec_type(config.delay_exec_type),
            engine: Arc::new(Engine::new()),
            names: Mutex::new(HashMap::new()),
            locker,
            span,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            held: Arc::new(AtomicBool::new(false)),
            leader: Mutex::new(None),
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource path every replica of this component locks.
    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    fn distributed(&self) -> bool {
        self.config.distributed_task && self.locker.is_some()
    }

    /// Whether this replica currently holds the component lock.
    pub fn is_leader(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Parses `spec` and registers `job` on it. Nothing is registered when
    /// the expression does not parse.
    pub fn add_job<J: NamedJob + 'static>(&self, spec: &str, job: J) -> Result<EntryId> {
        let schedule = self.parser.parse(spec)?;
        Ok(self.register(schedule, Arc::new(job)))
    }

    /// [`CronComponent::add_job`] for an async closure. The job is named
    /// after the closure's type.
    pub fn add_func<F, Fut>(&self, spec: &str, f: F) -> Result<EntryId>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), JobError>> + Send + 'static,
    {
        self.add_job(spec, FuncJob::new(f))
    }

    /// Registers `job` on an already built schedule.
    pub fn schedule<S, J>(&self, schedule: S, job: J) -> EntryId
    where
        S: Schedule + 'static,
        J: NamedJob + 'static,
    {
        self.register(Box::new(schedule), Arc::new(job))
    }

    fn register(&self, schedule: Box<dyn Schedule>, job: Arc<dyn NamedJob>) -> EntryId {
        let schedule: Arc<dyn Schedule> = if self.config.immediately_run {
            Arc::new(ImmediatelyOnce::new(schedule))
        } else {
            Arc::from(schedule)
        };

        let name = job.name();
        let wrapped: Arc<dyn Job> = Arc::new(WrappedJob::new(job, self.span.clone()));
        let id = self
            .engine
            .register(schedule, self.chain.apply(&name, wrapped));
        self.names().insert(name.clone(), id);

        self.span
            .in_scope(|| info!(job = %name, entry = %id, "add job"));
        id
    }

    fn names(&self) -> MutexGuard<'_, HashMap<String, EntryId>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entry(&self, id: EntryId) -> Option<Entry> {
        self.engine.entry(id)
    }

    /// Entry last registered under the job name `name`.
    pub fn entry_by_name(&self, name: &str) -> Option<Entry> {
        let id = self.names().get(name).copied()?;
        self.engine.entry(id)
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.engine.entries()
    }

    pub fn remove(&self, id: EntryId) -> bool {
        self.names().retain(|_, entry| *entry != id);
        self.engine.remove(id)
    }

    /// Starts scheduling. Returns immediately; in distributed mode the lock
    /// is acquired in the background. Calling it again does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let locker = match &self.locker {
            Some(locker) if self.config.distributed_task => locker.clone(),
            _ => {
                self.span
                    .in_scope(|| info!(entries = self.engine.len(), "cron start"));
                self.engine.start();
                return;
            }
        };

        let leader = Leader {
            locker,
            engine: Arc::clone(&self.engine),
            path: self.lock_path.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            held: Arc::clone(&self.held),
        };
        let handle = tokio::spawn(leader.run().instrument(self.span.clone()));
        *self.leader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stops the engine and, if this replica holds the lock, releases it
    /// within `wait_unlock_time`. Jobs already dispatched keep running; the
    /// returned [`RunningJobs`] resolves once they finish.
    pub async fn stop(&self) -> Result<RunningJobs> {
        self.shutdown.cancel();
        let running = self.engine.stop().await;

        let leader = self
            .leader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = leader {
            if let Err(e) = handle.await {
                self.span
                    .in_scope(|| error!(error = %e, "leader task failed"));
            }
        }

        if !self.distributed() || !self.held.load(Ordering::SeqCst) {
            return Ok(running);
        }
        let Some(locker) = &self.locker else {
            return Ok(running);
        };

        let path = self.lock_path.clone();
        let source: Box<dyn std::error::Error + Send + Sync> =
            match tokio::time::timeout(self.config.wait_unlock_time, locker.release(&path)).await {
                Ok(Ok(())) => {
                    self.held.store(false, Ordering::SeqCst);
                    self.span.in_scope(|| info!(path = %path, "lock released"));
                    return Ok(running);
                }
                Ok(Err(e)) => Box::new(e),
                Err(elapsed) => Box::new(elapsed),
            };

        self.span
            .in_scope(|| error!(path = %path, error = %source, "failed to release lock"));
        Err(CronError::Release { path, source })
    }
}

/// Background half of a distributed component: acquire, then lead.
struct Leader<L> {
    locker: L,
    engine: Arc<Engine>,
    path: String,
    config: CronConfig,
    shutdown: CancellationToken,
    held: Arc<AtomicBool>,
}

impl<L: LockClient> Leader<L> {
    async fn run(self) {
        if !self.acquire().await {
            return;
        }
        self.held.store(true, Ordering::SeqCst);
        info!(path = %self.path, "lock acquired");

        // stop() raced the acquisition; it releases the lock without the
        // engine ever starting.
        if self.shutdown.is_cancelled() {
            return;
        }

        info!(entries = self.engine.len(), "cron start");
        let renewal = tokio::spawn(
            renew(
                self.locker.clone(),
                self.path.clone(),
                self.config.refresh_gap,
                self.config.refresh_ttl,
                self.shutdown.clone(),
            )
            .in_current_span(),
        );

        self.engine.run().await;

        self.shutdown.cancel();
        if let Err(e) = renewal.await {
            error!(error = %e, "lock renewal task failed");
        }
    }

    /// Retries until the lock is ours. Returns `false` if stopped first.
    async fn acquire(&self) -> bool {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            // Cancelling drops an in-flight acquire. If the lock server
            // already granted it, the key outlives us until `lock_ttl`.
            let result = tokio::select! {
                biased;
                r = tokio::time::timeout(
                    self.config.wait_lock_time,
                    self.locker.acquire(&self.path, self.config.lock_ttl),
                ) => r,
                _ = self.shutdown.cancelled() => return false,
            };

            match result {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => {
                    warn!(path = %self.path, attempt, error = %e, "failed to acquire lock");
                }
                Err(_) => {
                    warn!(
                        path = %self.path,
                        attempt,
                        timeout = ?self.config.wait_lock_time,
                        "timed out acquiring lock"
                    );
                }
            }

            if self.config.lock_retry_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(self.config.lock_retry_delay) => {}
                }
            }
        }
    }
}

/// Refreshes the lock every `gap` until `shutdown`. Failures are logged and
/// do not stop the engine.
async fn renew<L: LockClient>(
    locker: L,
    path: String,
    gap: Duration,
    ttl: Duration,
    shutdown: CancellationToken,
) {
    if gap.is_zero() {
        warn!(path = %path, "refresh gap is zero, lock will not be refreshed");
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + gap, gap);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        // A refresh may not outlast the gap, or it would stall every later one.
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            r = tokio::time::timeout(gap, locker.refresh(&path, ttl)) => r,
        };
        match result {
            Ok(Ok(())) => debug!(path = %path, "lock refresh ok"),
            Ok(Err(e)) => error!(path = %path, error = %e, "failed to refresh lock"),
            Err(_) => error!(path = %path, timeout = ?gap, "timed out refreshing lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockLock;
    use crate::schedule::Every;
    use chrono::TimeDelta;

    type Ready = std::future::Ready<std::result::Result<(), JobError>>;

    fn noop(name: &'static str) -> FuncJob<impl Fn() -> Ready> {
        FuncJob::named(name, || std::future::ready(Ok(())))
    }

    #[test]
    fn distributed_without_locker_is_rejected() {
        let config = CronConfig::default().with_distributed_task(true);
        let err = CronComponent::new("billing", config).err().unwrap();
        assert!(matches!(err, CronError::MissingLocker { name } if name == "billing"));
    }

    #[test]
    fn lock_path_is_derived_from_the_name() {
        let component =
            CronComponent::with_locker("billing", CronConfig::default(), MockLock::new());
        assert_eq!(component.name(), "billing");
        assert_eq!(component.lock_path(), "/dcron/lock/billing");
        assert!(!component.is_leader());
    }

    #[test]
    fn invalid_expression_registers_nothing() {
        let component = CronComponent::new("c", CronConfig::default()).unwrap();
        let err = component.add_job("61 * * * *", noop("bad")).unwrap_err();

        assert!(matches!(err, CronError::InvalidCronExpression { .. }));
        assert!(component.entries().is_empty());
        assert!(component.entry_by_name("bad").is_none());
    }

    #[test]
    fn jobs_are_indexed_by_name() {
        let component = CronComponent::new("c", CronConfig::default()).unwrap();
        let a = component.add_job("*/5 * * * *", noop("rotate")).unwrap();
        let b = component.add_job("@hourly", noop("compact")).unwrap();

        assert_ne!(a, b);
        assert_eq!(component.entry_by_name("rotate").unwrap().id, a);
        assert_eq!(component.entry_by_name("compact").unwrap().id, b);
        assert!(component.entry_by_name("missing").is_none());
        assert_eq!(component.entries().len(), 2);
    }

    #[test]
    fn remove_clears_the_name_index() {
        let component = CronComponent::new("c", CronConfig::default()).unwrap();
        let id = component.add_job("@daily", noop("vacuum")).unwrap();

        assert!(component.remove(id));
        assert!(component.entry(id).is_none());
        assert!(component.entry_by_name("vacuum").is_none());
        assert!(!component.remove(id));
    }

    #[test]
    fn add_func_names_the_job_after_the_closure() {
        let component = CronComponent::new("c", CronConfig::default()).unwrap();
        component.add_func("@daily", || async { Ok(()) }).unwrap();

        let names: Vec<String> = component.names().keys().cloned().collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].contains("component::tests"), "got {}", names[0]);
    }

    #[tokio::test]
    async fn immediately_run_makes_the_first_fire_time_now() {
        let config = CronConfig::default().with_immediately_run(true);
        let component = CronComponent::new("c", config).unwrap();
        let id = component.schedule(Every::new(Duration::from_secs(3600)), noop("warmup"));

        let before = chrono::Utc::now();
        component.start();
        let next = component.entry(id).unwrap().next.unwrap();
        component.stop().await.unwrap();

        assert!(next - before < TimeDelta::seconds(1));
    }

    #[tokio::test]
    async fn standalone_stop_never_touches_the_lock() {
        let lock = MockLock::new();
        let component = CronComponent::with_locker("c", CronConfig::default(), lock.clone());
        component.add_job("@daily", noop("report")).unwrap();

        component.start();
        component.stop().await.unwrap();

        assert_eq!(lock.acquire_attempts(), 0);
        assert_eq!(lock.release_count(), 0);
        assert!(!component.is_leader());
    }
}
