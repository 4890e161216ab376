use std::future::Future;
use std::time::Duration;

/// Acquire, refresh, or release an exclusive lock on a resource path.
///
/// Every replica of a component calls these with the same path. At most one
/// caller holds the lock at a time; a held lock that is not refreshed expires
/// after its TTL. Timeouts are applied by the caller.
pub trait LockClient: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Wait until the lock on `path` is ours, held for `ttl`.
    fn acquire(
        &self,
        path: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Extend a held lock by `ttl`. Fails if the lock is no longer ours.
    fn refresh(
        &self,
        path: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Give the lock up so another replica can take it without waiting for the TTL.
    fn release(&self, path: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Publish a tick notification to a NATS subject.
pub trait TickPublisher: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish_tick(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: bytes::Bytes,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
