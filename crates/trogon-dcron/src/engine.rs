use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::job::Job;
use crate::schedule::Schedule;

/// Identifies a registered entry. Assigned from 1 upwards, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered (schedule, job) pair.
#[derive(Clone)]
pub struct Entry {
    pub id: EntryId,
    pub schedule: Arc<dyn Schedule>,
    pub job: Arc<dyn Job>,
    /// Next fire time. `None` before the engine starts, or once the schedule
    /// is exhausted.
    pub next: Option<DateTime<Utc>>,
    /// Last time the entry was dispatched.
    pub prev: Option<DateTime<Utc>>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("next", &self.next)
            .field("prev", &self.prev)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

struct Table {
    state: EngineState,
    entries: Vec<Entry>,
}

/// Entry table plus the wait/dispatch loop.
///
/// The loop sleeps until the earliest next fire time (or until an entry is
/// added or removed), then dispatches every due entry, earliest first, each
/// on its own task. Job bodies never block the loop.
pub struct Engine {
    table: Mutex<Table>,
    next_id: AtomicU64,
    wake: Notify,
    shutdown: CancellationToken,
    exited: CancellationToken,
    jobs: TaskTracker,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                state: EngineState::Idle,
                entries: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            exited: CancellationToken::new(),
            jobs: TaskTracker::new(),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, schedule: Arc<dyn Schedule>, job: Arc<dyn Job>) -> EntryId {
        let id = EntryId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let running = {
            let mut table = self.table();
            let running = table.state == EngineState::Running;
            let next = if running {
                schedule.next(Utc::now())
            } else {
                None
            };
            table.entries.push(Entry {
                id,
                schedule,
                job,
                next,
                prev: None,
            });
            running
        };
        if running {
            self.wake.notify_one();
        }
        id
    }

    pub fn entry(&self, id: EntryId) -> Option<Entry> {
        self.table().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Removes an entry. Returns `false` if it was not registered.
    pub fn remove(&self, id: EntryId) -> bool {
        let (removed, running) = {
            let mut table = self.table();
            let before = table.entries.len();
            table.entries.retain(|e| e.id != id);
            (
                table.entries.len() != before,
                table.state == EngineState::Running,
            )
        };
        if removed && running {
            self.wake.notify_one();
        }
        removed
    }

    /// Snapshot of all entries ordered by next fire time, unscheduled last.
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries = self.table().entries.clone();
        entries.sort_by_key(|e| (e.next.is_none(), e.next));
        entries
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> EngineState {
        self.table().state
    }

    /// Spawns the loop on the current Tokio runtime. Returns `false` without
    /// doing anything if the engine already ran.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.begin() {
            return false;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_loop().await });
        true
    }

    /// Runs the loop in the calling task until [`Engine::stop`].
    pub async fn run(&self) {
        if self.begin() {
            self.run_loop().await;
        }
    }

    /// Signals the loop to exit and waits until it has. Jobs already
    /// dispatched keep running; await [`RunningJobs::wait`] for them.
    pub async fn stop(&self) -> RunningJobs {
        let was_running = {
            let mut table = self.table();
            let previous = table.state;
            table.state = EngineState::Stopped;
            previous == EngineState::Running
        };
        self.shutdown.cancel();
        if was_running {
            self.exited.cancelled().await;
        }
        self.jobs.close();
        RunningJobs {
            tracker: self.jobs.clone(),
        }
    }

    /// Idle -> Running, computing the first fire time of every entry.
    pub(crate) fn begin(&self) -> bool {
        let mut table = self.table();
        if table.state != EngineState::Idle {
            return false;
        }
        table.state = EngineState::Running;
        let now = Utc::now();
        for entry in table.entries.iter_mut() {
            entry.next = entry.schedule.next(now);
        }
        true
    }

    async fn run_loop(&self) {
        let _exited = self.exited.clone().drop_guard();
        info!(entries = self.len(), "cron engine started");

        loop {
            let wait = self.until_next(Utc::now());
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = sleep_for(wait) => {
                    self.dispatch_due(Utc::now());
                }
            }
        }

        info!("cron engine stopped");
    }

    fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.table()
            .entries
            .iter()
            .filter_map(|e| e.next)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Dispatches every entry due at `now`, earliest first, and reschedules
    /// it. Returns the dispatched ids in dispatch order.
    pub(crate) fn dispatch_due(&self, now: DateTime<Utc>) -> Vec<EntryId> {
        let due: Vec<(EntryId, Arc<dyn Job>)> = {
            let mut table = self.table();
            let mut due: Vec<&mut Entry> = table
                .entries
                .iter_mut()
                .filter(|e| e.next.is_some_and(|t| t <= now))
                .collect();
            due.sort_by_key(|e| e.next);
            due.into_iter()
                .map(|e| {
                    e.prev = e.next;
                    e.next = e.schedule.next(now);
                    debug!(entry = %e.id, next = ?e.next, "dispatching cron entry");
                    (e.id, Arc::clone(&e.job))
                })
                .collect()
        };

        due.into_iter()
            .map(|(id, job)| {
                self.jobs.spawn(async move { job.run().await });
                id
            })
            .collect()
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Job bodies dispatched before [`Engine::stop`] returned.
pub struct RunningJobs {
    tracker: TaskTracker,
}

impl RunningJobs {
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Resolves once every dispatched job body has finished.
    pub async fn wait(self) {
        self.tracker.wait().await;
    }
}
