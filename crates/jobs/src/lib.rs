//! Durable notification and event pipeline over a SQL-backed queue.
//!
//! Jobs are rows in the `_job_` table. A `notification` row records a
//! resource mutation and is enqueued inside the same transaction as the
//! mutation itself; an `event` row is an application-level trigger, and
//! redundant events sharing a compression key are coalesced by an upsert.
//! Dispatch claims one row per transaction with `FOR UPDATE SKIP LOCKED`,
//! so concurrent workers never block each other and delivery is
//! at-least-once: handlers must be idempotent.

use models::Operation;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

mod pipeline;
mod queue;
mod rate;

pub use pipeline::{Pipeline, PipelineBuilder};
pub use queue::{ensure_job_table, FailedJob};
pub use rate::RateLimit;

/// A resource mutation delivered to a notification handler.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub resource: String,
    pub operation: Operation,
    pub resource_id: Uuid,
    /// The mutated object, as returned to the caller. Empty for clears.
    pub payload: serde_json::Value,
}

/// An application-level event. Events sharing `(type, key, resource,
/// resource_id)` are coalesced while queued; callers who want every
/// occurrence delivered provide a unique `key`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub resource_id: Uuid,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            key: String::new(),
            resource: String::new(),
            resource_id: Uuid::nil(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn with_resource(mut self, resource: &str, resource_id: Uuid) -> Self {
        self.resource = resource.to_string();
        self.resource_id = resource_id;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Logging context persisted with each job and restored around its
/// handler invocation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct JobContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

/// Execution scope handed to a handler. Events raised through it join the
/// job's own transaction: they become visible only when the job commits,
/// which keeps a handler from racing its own follow-up events.
pub struct JobExecution<'a> {
    pub(crate) txn: &'a mut sqlx::PgConnection,
    pub(crate) pipeline: &'a Pipeline,
    pub(crate) context: JobContext,
}

impl<'a> JobExecution<'a> {
    /// The backend's connection pool, for queries outside the job
    /// transaction.
    pub fn pool(&self) -> &sqlx::PgPool {
        self.pipeline.pool()
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    /// Raise an event within the job transaction. Rate limits for the
    /// event type apply.
    pub async fn raise_event(&mut self, event: Event) -> sqlx::Result<()> {
        let scheduled_at = self.pipeline.schedule_for(&event.type_);
        queue::enqueue_event(
            &mut *self.txn,
            self.pipeline.schema(),
            &event,
            scheduled_at,
            self.pipeline.max_attempts(),
            &self.context,
        )
        .await
    }
}

/// Handler for notifications of one resource. Delivery is at-least-once;
/// implementations must tolerate replays.
#[async_trait::async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn notify(
        &self,
        exec: &mut JobExecution<'_>,
        notification: Notification,
    ) -> anyhow::Result<()>;
}

/// Handler for one event type. Delivery is at-least-once; implementations
/// must tolerate replays.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, exec: &mut JobExecution<'_>, event: Event) -> anyhow::Result<()>;
}

pub(crate) type NotificationHandlers = BTreeMap<(String, Operation), Arc<dyn NotificationHandler>>;
pub(crate) type EventHandlers = BTreeMap<String, Arc<dyn EventHandler>>;
