use std::time::Duration;

use async_nats::jetstream::{self, kv};

use crate::error::CronError;

pub const LOCK_BUCKET: &str = "cron_locks";

/// Get or create the lock bucket. Entries older than `ttl` are purged, so a
/// lock nobody refreshes disappears after `ttl`.
pub async fn get_or_create_lock_bucket(
    js: &jetstream::Context,
    bucket: &str,
    ttl: Duration,
) -> Result<kv::Store, CronError> {
    let config = kv::Config {
        bucket: bucket.to_string(),
        history: 1,
        max_age: ttl,
        ..Default::default()
    };
    match js.create_key_value(config).await {
        Ok(store) => Ok(store),
        Err(_) => js
            .get_key_value(bucket)
            .await
            .map_err(|e| CronError::Kv(e.to_string())),
    }
}

/// KV key for a lock resource path: `/dcron/lock/billing` -> `dcron.lock.billing`.
pub fn lock_key(path: &str) -> String {
    path.trim_matches('/').replace('/', ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_maps_path_segments_to_tokens() {
        assert_eq!(lock_key("/dcron/lock/billing"), "dcron.lock.billing");
        assert_eq!(lock_key("jobs/reports/"), "jobs.reports");
        assert_eq!(lock_key("single"), "single");
    }
}
