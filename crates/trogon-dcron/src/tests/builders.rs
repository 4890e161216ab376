use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::CronConfig;
use crate::error::JobError;
use crate::job::NamedJob;

/// Runs recorded by every [`RecordingJob`] sharing it, in start order.
#[derive(Clone, Default)]
pub(crate) struct RunLog {
    runs: Arc<Mutex<Vec<(&'static str, Instant)>>>,
}

impl RunLog {
    pub(crate) fn count(&self, replica: &str) -> usize {
        self.runs.lock().unwrap().iter().filter(|(r, _)| *r == replica).count()
    }

    pub(crate) fn total(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub(crate) fn first(&self, replica: &str) -> Option<Instant> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| *r == replica)
            .map(|(_, at)| *at)
    }

    pub(crate) fn last(&self, replica: &str) -> Option<Instant> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _)| *r == replica)
            .map(|(_, at)| *at)
    }
}

pub(crate) struct RecordingJob {
    name: &'static str,
    replica: &'static str,
    log: RunLog,
    fail: bool,
}

impl RecordingJob {
    pub(crate) fn new(name: &'static str, replica: &'static str, log: &RunLog) -> Self {
        Self {
            name,
            replica,
            log: log.clone(),
            fail: false,
        }
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl NamedJob for RecordingJob {
    fn name(&self) -> String {
        self.name.to_string()
    }

    async fn run(&self) -> Result<(), JobError> {
        self.log
            .runs
            .lock()
            .unwrap()
            .push((self.replica, Instant::now()));
        if self.fail {
            return Err("upstream returned 503".into());
        }
        Ok(())
    }
}

/// Distributed config with timings short enough for tests.
pub(crate) fn fast_config() -> CronConfig {
    CronConfig::default()
        .with_distributed_task(true)
        .with_lock_ttl(Duration::from_millis(500))
        .with_wait_lock_time(Duration::from_millis(200))
        .with_wait_unlock_time(Duration::from_millis(200))
        .with_refresh(Duration::from_millis(50), Duration::from_millis(500))
}

/// Polls `cond` until it holds or `within` elapses.
pub(crate) async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
