//! Integration tests against a real NATS server.
//!
//! Run with:
//!   NATS_TEST_URL=nats://localhost:4222 cargo test -p trogon-dcron --test integration \
//!     -- --include-ignored --test-threads=1
//!
//! Each test uses its own lock bucket and component name so runs do not
//! steal each other's locks.

use std::time::Duration;

use async_nats::jetstream;
use futures::StreamExt;
use trogon_dcron::kv::lock_key;
use trogon_dcron::{
    CronComponent, CronConfig, LockClient, NatsKvLock, PublishJob, TickPayload,
};
use uuid::Uuid;

fn test_url() -> String {
    std::env::var("NATS_TEST_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

async fn connect() -> async_nats::Client {
    async_nats::connect(test_url())
        .await
        .expect("Failed to connect to NATS (is NATS_TEST_URL set and NATS running?)")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

async fn lock_pair(js: &jetstream::Context, ttl: Duration) -> (NatsKvLock, NatsKvLock) {
    let bucket = unique("cron_locks_test");
    let a = NatsKvLock::with_bucket(js, &bucket, ttl).await.unwrap();
    let b = NatsKvLock::with_bucket(js, &bucket, ttl).await.unwrap();
    (a, b)
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn second_client_waits_until_the_first_releases() {
    let js = jetstream::new(connect().await);
    let (a, b) = lock_pair(&js, Duration::from_secs(30)).await;
    let path = "/dcron/lock/billing";

    a.acquire(path, Duration::from_secs(30)).await.unwrap();
    let blocked = tokio::time::timeout(
        Duration::from_millis(600),
        b.acquire(path, Duration::from_secs(30)),
    )
    .await;
    assert!(blocked.is_err(), "second client acquired a held lock");

    a.refresh(path, Duration::from_secs(30)).await.unwrap();
    a.release(path).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), b.acquire(path, Duration::from_secs(30)))
        .await
        .expect("lock was not handed over")
        .unwrap();
    b.release(path).await.unwrap();
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn unrefreshed_lock_expires_after_the_bucket_max_age() {
    let js = jetstream::new(connect().await);
    let (a, b) = lock_pair(&js, Duration::from_secs(1)).await;
    let path = "/dcron/lock/expiry";

    a.acquire(path, Duration::from_secs(1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), b.acquire(path, Duration::from_secs(1)))
        .await
        .expect("expired lock was never taken over")
        .unwrap();

    // `a` lost the key to `b`; its revision no longer matches.
    assert!(a.refresh(path, Duration::from_secs(1)).await.is_err());
    b.release(path).await.unwrap();
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn lock_key_holds_the_node_id() {
    let js = jetstream::new(connect().await);
    let bucket = unique("cron_locks_test");
    let lock = NatsKvLock::with_bucket(&js, &bucket, Duration::from_secs(30))
        .await
        .unwrap();
    let path = "/dcron/lock/owner";

    lock.acquire(path, Duration::from_secs(30)).await.unwrap();

    let store = js.get_key_value(&bucket).await.unwrap();
    let value = store.get(lock_key(path)).await.unwrap().unwrap();
    assert_eq!(value.as_ref(), lock.node_id().as_bytes());

    lock.release(path).await.unwrap();
    assert!(store.get(lock_key(path)).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn distributed_component_publishes_ticks_from_one_replica() {
    let nats = connect().await;
    let js = jetstream::new(nats.clone());
    let (lock_a, lock_b) = lock_pair(&js, Duration::from_secs(5)).await;

    let name = unique("billing");
    let subject = format!("cron.test.{}", Uuid::new_v4().simple());
    let mut ticks = nats.subscribe(subject.clone()).await.unwrap();

    let config = CronConfig::default()
        .with_distributed_task(true)
        .with_immediately_run(true)
        .with_wait_lock_time(Duration::from_millis(500))
        .with_refresh(Duration::from_secs(1), Duration::from_secs(5));

    let a = CronComponent::with_locker(name.clone(), config.clone(), lock_a);
    let b = CronComponent::with_locker(name, config, lock_b);
    a.add_job("@yearly", PublishJob::new(subject.clone(), nats.clone()))
        .unwrap();
    b.add_job("@yearly", PublishJob::new(subject.clone(), nats.clone()))
        .unwrap();

    a.start();
    let first = tokio::time::timeout(Duration::from_secs(5), ticks.next())
        .await
        .expect("no tick published")
        .unwrap();
    b.start();

    let tick: TickPayload = serde_json::from_slice(&first.payload).unwrap();
    assert_eq!(tick.job, subject);

    let extra = tokio::time::timeout(Duration::from_secs(1), ticks.next()).await;
    assert!(extra.is_err(), "standby replica published while the leader held the lock");

    a.stop().await.unwrap().wait().await;
    let handover = tokio::time::timeout(Duration::from_secs(5), ticks.next())
        .await
        .expect("standby did not take over")
        .unwrap();
    let tick: TickPayload = serde_json::from_slice(&handover.payload).unwrap();
    assert_eq!(tick.job, subject);
    assert!(b.is_leader());

    b.stop().await.unwrap().wait().await;
}
