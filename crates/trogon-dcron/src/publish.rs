use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::NamedJob;
use crate::traits::TickPublisher;

/// JetStream de-duplicates messages carrying the same id within its window.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Body of every published tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    pub job: String,
    pub fired_at: DateTime<Utc>,
    /// Unique per execution. Use for deduplication on the consumer side.
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Job that publishes a [`TickPayload`] to `subject` on every run.
pub struct PublishJob<P> {
    name: String,
    subject: String,
    payload: Option<serde_json::Value>,
    publisher: P,
}

impl<P: TickPublisher> PublishJob<P> {
    /// The job is named after the subject it publishes to.
    pub fn new(subject: impl Into<String>, publisher: P) -> Self {
        let subject = subject.into();
        Self {
            name: subject.clone(),
            subject,
            payload: None,
            publisher,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Static JSON attached to every tick.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    fn tick(&self) -> TickPayload {
        TickPayload {
            job: self.name.clone(),
            fired_at: Utc::now(),
            execution_id: Uuid::new_v4().to_string(),
            payload: self.payload.clone(),
        }
    }
}

#[async_trait]
impl<P: TickPublisher> NamedJob for PublishJob<P> {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self) -> Result<(), JobError> {
        let tick = self.tick();
        let body = serde_json::to_vec(&tick)?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, tick.execution_id.as_str());

        self.publisher
            .publish_tick(self.subject.clone(), headers, Bytes::from(body))
            .await?;
        debug!(subject = %self.subject, execution_id = %tick.execution_id, "published tick");
        Ok(())
    }
}
