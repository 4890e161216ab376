//! # trogon-dcron
//!
//! Cron scheduling for replicated services: every replica of a component
//! registers the same jobs, and only the replica holding the component's
//! lock runs them.
//!
//! ## Features
//!
//! - Standard 5-field expressions, optional seconds field, `@hourly`-style
//!   descriptors, `@every <duration>` and `TZ=`/`CRON_TZ=` prefixes.
//! - Distributed mode: the leader is elected through a [`LockClient`]; a
//!   NATS KV implementation ([`NatsKvLock`]) is included.
//! - The lock is refreshed in the background and released on `stop()` so a
//!   standby replica takes over without waiting for the TTL.
//! - Every run is logged with the job name; failures and panics never reach
//!   the scheduler loop.
//! - Overlapping runs of one job are skipped, queued, or allowed
//!   ([`DelayExecType`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trogon_dcron::{CronComponent, CronConfig, FuncJob, NatsKvLock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let nats = async_nats::connect("nats://localhost:4222").await?;
//!     let js = async_nats::jetstream::new(nats);
//!
//!     let config = CronConfig::default().with_distributed_task(true);
//!     let lock = NatsKvLock::new(&js, config.lock_ttl).await?;
//!     let cron = CronComponent::with_locker("billing", config, lock);
//!
//!     cron.add_job(
//!         "*/5 * * * *",
//!         FuncJob::named("invoice-sweep", || async { Ok(()) }),
//!     )?;
//!     cron.start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     cron.stop().await?.wait().await;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod component;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod job;
pub mod kv;
pub mod nats_impls;
pub mod parser;
pub mod publish;
pub mod schedule;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

#[cfg(test)]
mod tests;

pub use component::{CronComponent, NoLock};
pub use config::{CronConfig, DelayExecType, ServiceConfig};
pub use engine::{Engine, Entry, EntryId, RunningJobs};
pub use error::{CronError, JobError};
pub use job::{FuncJob, Job, NamedJob, WrappedJob};
pub use nats_impls::NatsKvLock;
pub use parser::Parser;
pub use publish::{PublishJob, TickPayload};
pub use schedule::{CronSchedule, Every, ImmediatelyOnce, Schedule};
pub use traits::{LockClient, TickPublisher};
