use thiserror::Error;

pub type Result<T> = std::result::Result<T, CronError>;

/// Error returned by a job body. Boxed so jobs can `?` any error type.
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Cron component '{name}' is distributed but has no lock client")]
    MissingLocker { name: String },

    #[error("cron stop err: failed to release lock '{path}': {source}")]
    Release {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("KV error: {0}")]
    Kv(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
