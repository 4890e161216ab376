use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::error::CronError;
use crate::kv::{LOCK_BUCKET, get_or_create_lock_bucket, lock_key};
use crate::traits::{LockClient, TickPublisher};

const ACQUIRE_POLL: Duration = Duration::from_millis(250);

/// Concrete `TickPublisher` backed by an `async_nats::Client`.
impl TickPublisher for async_nats::Client {
    type Error = async_nats::client::PublishError;

    async fn publish_tick(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: Bytes,
    ) -> Result<(), Self::Error> {
        self.publish_with_headers(subject, headers, payload).await
    }
}

/// Concrete `LockClient` backed by a NATS KV bucket.
///
/// The lock is a key created with `create`, which fails while the key exists.
/// The bucket's `max_age` is the effective TTL: the `ttl` arguments of
/// [`LockClient`] are not consulted, and a refresh rewrites the key to reset
/// its age. Refresh and release are revision-checked, so a replica whose key
/// expired and was re-created by another replica cannot touch it.
#[derive(Clone)]
pub struct NatsKvLock {
    store: kv::Store,
    node_id: String,
    revisions: Arc<Mutex<HashMap<String, u64>>>,
}

impl NatsKvLock {
    /// Lock client on the default `cron_locks` bucket.
    pub async fn new(js: &jetstream::Context, ttl: Duration) -> Result<Self, CronError> {
        Self::with_bucket(js, LOCK_BUCKET, ttl).await
    }

    pub async fn with_bucket(
        js: &jetstream::Context,
        bucket: &str,
        ttl: Duration,
    ) -> Result<Self, CronError> {
        let store = get_or_create_lock_bucket(js, bucket, ttl).await?;
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: kv::Store) -> Self {
        Self {
            store,
            node_id: Uuid::new_v4().to_string(),
            revisions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Value written into every key this client holds.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn revisions(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.revisions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_held(path: &str) -> CronError {
        CronError::Kv(format!("lock '{path}' is not held"))
    }
}

impl LockClient for NatsKvLock {
    type Error = CronError;

    async fn acquire(&self, path: &str, _ttl: Duration) -> Result<(), CronError> {
        let key = lock_key(path);
        loop {
            match self
                .store
                .create(&key, Bytes::from(self.node_id.clone()))
                .await
            {
                Ok(revision) => {
                    self.revisions().insert(path.to_string(), revision);
                    return Ok(());
                }
                Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => {
                    tokio::time::sleep(ACQUIRE_POLL).await;
                }
                Err(e) => return Err(CronError::Kv(e.to_string())),
            }
        }
    }

    async fn refresh(&self, path: &str, _ttl: Duration) -> Result<(), CronError> {
        let revision = self
            .revisions()
            .get(path)
            .copied()
            .ok_or_else(|| Self::not_held(path))?;

        match self
            .store
            .update(lock_key(path), Bytes::from(self.node_id.clone()), revision)
            .await
        {
            Ok(next) => {
                self.revisions().insert(path.to_string(), next);
                debug!(path = %path, revision = next, "lock refreshed");
                Ok(())
            }
            Err(e) => {
                self.revisions().remove(path);
                Err(CronError::Kv(e.to_string()))
            }
        }
    }

    async fn release(&self, path: &str) -> Result<(), CronError> {
        let revision = self
            .revisions()
            .remove(path)
            .ok_or_else(|| Self::not_held(path))?;

        self.store
            .delete_expect_revision(lock_key(path), Some(revision))
            .await
            .map_err(|e| CronError::Kv(e.to_string()))
    }
}
