//! Middleware applied around every registered job.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::DelayExecType;
use crate::job::Job;

const DELAY_LOG_THRESHOLD: Duration = Duration::from_secs(60);

/// Decorates a [`Job`] with extra behaviour.
pub trait JobWrapper: Send + Sync {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job>;
}

/// Ordered list of wrappers; the first one ends up outermost.
#[derive(Clone, Default)]
pub struct Chain {
    wrappers: Vec<Arc<dyn JobWrapper>>,
}

impl Chain {
    /// `Recover` followed by the wrapper selected by `delay`.
    pub fn for_delay_exec_type(delay: DelayExecType) -> Self {
        let mut wrappers: Vec<Arc<dyn JobWrapper>> = vec![Arc::new(Recover)];
        match delay {
            DelayExecType::Skip => wrappers.push(Arc::new(SkipIfStillRunning)),
            DelayExecType::Queue => wrappers.push(Arc::new(DelayIfStillRunning)),
            DelayExecType::Concurrent => {}
        }
        Self { wrappers }
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    pub fn apply(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        self.wrappers
            .iter()
            .rev()
            .fold(job, |job, wrapper| wrapper.wrap(name, job))
    }
}

/// Catches panics raised while a job runs and logs them.
pub struct Recover;

impl JobWrapper for Recover {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        Arc::new(RecoverJob {
            name: name.to_string(),
            inner: job,
        })
    }
}

struct RecoverJob {
    name: String,
    inner: Arc<dyn Job>,
}

#[async_trait]
impl Job for RecoverJob {
    async fn run(&self) {
        if let Err(panic) = AssertUnwindSafe(self.inner.run()).catch_unwind().await {
            error!(job = %self.name, panic = %panic_message(&panic), "job panicked");
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Drops a run when the previous run of the same job has not finished.
pub struct SkipIfStillRunning;

impl JobWrapper for SkipIfStillRunning {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        Arc::new(SkipJob {
            name: name.to_string(),
            inner: job,
            running: AtomicBool::new(false),
        })
    }
}

struct SkipJob {
    name: String,
    inner: Arc<dyn Job>,
    running: AtomicBool,
}

struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Job for SkipJob {
    async fn run(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(job = %self.name, "skip: previous run still in progress");
            return;
        }
        let _clear = ClearOnDrop(&self.running);
        self.inner.run().await;
    }
}

/// Serializes runs of the same job: a run waits for the previous one.
pub struct DelayIfStillRunning;

impl JobWrapper for DelayIfStillRunning {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        Arc::new(DelayJob {
            name: name.to_string(),
            inner: job,
            lock: Mutex::new(()),
        })
    }
}

struct DelayJob {
    name: String,
    inner: Arc<dyn Job>,
    lock: Mutex<()>,
}

#[async_trait]
impl Job for DelayJob {
    async fn run(&self) {
        let queued_at = tokio::time::Instant::now();
        let _serial = self.lock.lock().await;
        let waited = queued_at.elapsed();
        if waited > DELAY_LOG_THRESHOLD {
            info!(job = %self.name, waited = ?waited, "delay: previous run held this one back");
        }
        self.inner.run().await;
    }
}
