use crate::queue::{self, JobRow, JOB_EVENT, JOB_NOTIFICATION};
use crate::rate::RateState;
use crate::{
    Event, EventHandlers, FailedJob, JobContext, JobExecution, Notification, NotificationHandler,
    NotificationHandlers, RateLimit,
};
use crate::EventHandler;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use models::Operation;
use tracing::Instrument;
use sqlx::Acquire;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

/// When idle, the interval between polls for due jobs. Triggers and due
/// `scheduled_at` times wake the loop earlier.
const DEQUEUE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_MAX_ATTEMPTS: i32 = 4;

/// Builder for a [`Pipeline`]. All registration happens here, before the
/// pipeline exists: runtime mutation of the handler registries is not
/// supported, and registering twice for the same key is fatal.
pub struct PipelineBuilder {
    concurrency: usize,
    max_attempts: i32,
    retry_timeouts: Vec<std::time::Duration>,
    notification_handlers: NotificationHandlers,
    event_handlers: EventHandlers,
    rate_limits: BTreeMap<String, RateLimit>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_timeouts: vec![
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(60),
                std::time::Duration::from_secs(300),
            ],
            notification_handlers: BTreeMap::new(),
            event_handlers: BTreeMap::new(),
            rate_limits: BTreeMap::new(),
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Back-off before each retry. Entry N delays the N+1'th attempt;
    /// shorter sequences repeat their last entry.
    pub fn retry_timeouts(mut self, timeouts: Vec<std::time::Duration>) -> Self {
        self.retry_timeouts = timeouts;
        self
    }

    /// Register `handler` for the given operations of `resource`.
    pub fn notification_handler(
        mut self,
        resource: &str,
        operations: &[Operation],
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        for operation in operations {
            let replaced = self
                .notification_handlers
                .insert((resource.to_string(), *operation), handler.clone());
            if replaced.is_some() {
                panic!("a notification handler for {resource:?} {operation} is already registered");
            }
        }
        self
    }

    pub fn event_handler(mut self, type_: &str, handler: Arc<dyn EventHandler>) -> Self {
        if self
            .event_handlers
            .insert(type_.to_string(), handler)
            .is_some()
        {
            panic!("an event handler for {type_:?} is already registered");
        }
        self
    }

    /// Space deliveries of `type_` at least `delta` apart, with at most
    /// `max_age` worth of accumulated backlog.
    pub fn rate_limit(mut self, type_: &str, limit: RateLimit) -> Self {
        self.rate_limits.insert(type_.to_string(), limit);
        self
    }

    pub fn build(self, pool: sqlx::PgPool, schema: &str) -> Pipeline {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Pipeline {
            pool,
            schema: schema.to_string(),
            concurrency: self.concurrency,
            max_attempts: self.max_attempts,
            retry_timeouts: self.retry_timeouts,
            notification_handlers: self.notification_handlers,
            event_handlers: self.event_handlers,
            rate_limits: self.rate_limits,
            rate_state: std::sync::Mutex::new(RateState::default()),
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(trigger_rx),
        }
    }
}

/// The job pipeline: enqueues notifications and events into the `_job_`
/// table and drains them through the registered handlers.
pub struct Pipeline {
    pool: sqlx::PgPool,
    schema: String,
    concurrency: usize,
    max_attempts: i32,
    retry_timeouts: Vec<std::time::Duration>,
    notification_handlers: NotificationHandlers,
    event_handlers: EventHandlers,
    rate_limits: BTreeMap<String, RateLimit>,
    rate_state: std::sync::Mutex<RateState>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Pipeline {
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub(crate) fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub fn has_notification_handler(&self, resource: &str, operation: Operation) -> bool {
        self.notification_handlers
            .contains_key(&(resource.to_string(), operation))
    }

    pub fn has_event_handler(&self, type_: &str) -> bool {
        self.event_handlers.contains_key(type_)
    }

    /// Delivery slot for a newly raised event, per the type's rate limit.
    /// Unlimited types dispatch immediately.
    pub(crate) fn schedule_for(&self, type_: &str) -> Option<DateTime<Utc>> {
        let limit = self.rate_limits.get(type_)?;
        let mut state = self.rate_state.lock().expect("rate state lock poisoned");
        Some(state.next_slot(type_, limit, Utc::now()))
    }

    /// Enqueue a notification within the caller's transaction. Skipped
    /// entirely when no handler is registered for the pair; returns
    /// whether a row was written. Call [`Pipeline::trigger`] after the
    /// transaction commits.
    pub async fn enqueue_notification(
        &self,
        txn: &mut sqlx::PgConnection,
        notification: &Notification,
        context: &JobContext,
    ) -> sqlx::Result<bool> {
        if !self.has_notification_handler(&notification.resource, notification.operation) {
            return Ok(false);
        }
        queue::enqueue_notification(txn, &self.schema, notification, self.max_attempts, context)
            .await?;
        Ok(true)
    }

    /// Raise an event from outside a job handler. The write commits on
    /// its own connection and the pipeline is triggered.
    pub async fn raise_event(&self, event: &Event, context: &JobContext) -> sqlx::Result<()> {
        let scheduled_at = self.schedule_for(&event.type_);
        let mut conn = self.pool.acquire().await?;
        queue::enqueue_event(
            &mut conn,
            &self.schema,
            event,
            scheduled_at,
            self.max_attempts,
            context,
        )
        .await?;
        self.trigger();
        Ok(())
    }

    /// Wake the drain loop. The single-slot channel makes this cheap to
    /// call redundantly.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Jobs whose attempts are exhausted, for the health endpoint.
    pub async fn failed_jobs(&self) -> sqlx::Result<Vec<FailedJob>> {
        queue::failed_jobs(&self.pool, &self.schema).await
    }

    /// Synchronously drain up to `max` due jobs, returning whether more
    /// work remains. Intended for tests.
    pub async fn process_jobs(&self, max: usize) -> anyhow::Result<bool> {
        let mut handled = 0;
        while handled < max {
            if !self.step().await? {
                return Ok(false);
            }
            handled += 1;
        }
        Ok(queue::ready_count(&self.pool, &self.schema).await? > 0)
    }

    /// Serve the pipeline until `shutdown` resolves: wait for a trigger,
    /// a due schedule or the idle interval, then drain with a pool of
    /// `concurrency` workers.
    pub async fn serve(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut trigger_rx = self.trigger_rx.lock().await;

        loop {
            () = self.drain_cycle().await;

            let idle_for = match self.next_wakeup().await {
                Some(at) => (at - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO)
                    .min(DEQUEUE_INTERVAL),
                None => DEQUEUE_INTERVAL,
            };

            tokio::select! {
                () = &mut shutdown => break,
                _ = trigger_rx.recv() => (),
                () = tokio::time::sleep(idle_for) => (),
            }
        }
        tracing::info!("job pipeline signaled to stop");
    }

    /// One drain cycle: a fresh pool of workers, each claiming jobs until
    /// the queue has no more due work.
    async fn drain_cycle(&self) {
        let workers = (0..self.concurrency).map(|worker| async move {
            loop {
                match self.step().await {
                    Ok(true) => (),
                    Ok(false) => break,
                    Err(err) => {
                        tracing::error!(?err, worker, "job dispatch failed, ending drain cycle");
                        break;
                    }
                }
            }
        });
        let () = futures::future::join_all(workers).await.into_iter().collect();
    }

    /// Earliest future `scheduled_at` among pending jobs.
    async fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        use sqlx::Row;
        let row = sqlx::query(&format!(
            r#"SELECT min("scheduled_at") AS "at" FROM "{}"."_job_"
  WHERE "attempts_left" > 0 AND "scheduled_at" > now()"#,
            self.schema
        ))
        .fetch_one(&self.pool)
        .await
        .ok()?;
        row.try_get::<Option<DateTime<Utc>>, _>("at").ok()?
    }

    /// Claim and run a single job. Returns whether a job was claimed.
    ///
    /// The claim's decrement is held by the outer transaction. The row is
    /// removed inside a savepoint before the handler runs, so a handler
    /// re-raising its own compression key inserts a fresh row instead of
    /// colliding with the claimed one; rolling back the savepoint on
    /// failure restores the row while keeping the decrement.
    async fn step(&self) -> anyhow::Result<bool> {
        let mut txn = self.pool.begin().await?;
        let Some(job) = queue::pick(&mut txn, &self.schema).await? else {
            txn.rollback().await?;
            return Ok(false);
        };

        let context: JobContext = serde_json::from_value(job.context.clone()).unwrap_or_default();
        let span = tracing::info_span!(
            "job",
            serial = job.serial,
            job = %job.job,
            job_type = %job.type_,
            resource = %job.resource,
            request_id = ?context.request_id,
        );

        let mut savepoint = txn.begin().await?;
        queue::delete(&mut savepoint, &self.schema, job.serial).await?;

        let outcome = AssertUnwindSafe(self.invoke(&mut savepoint, &job, context))
            .catch_unwind()
            .instrument(span)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!("job handler panicked: {}", panic_message(&panic))),
        };

        match outcome {
            Ok(()) => {
                savepoint.commit().await?;
                txn.commit().await?;
                tracing::debug!("job handled");
            }
            Err(err) => {
                savepoint.rollback().await?;
                if job.attempts_left > 0 {
                    let at = self.retry_schedule(&job);
                    queue::reschedule(&mut txn, &self.schema, job.serial, at).await?;
                    tracing::warn!(?err, attempts_left = job.attempts_left, retry_at = %at, "job failed, scheduled for retry");
                } else {
                    tracing::error!(?err, "job failed terminally");
                }
                txn.commit().await?;
            }
        }
        Ok(true)
    }

    async fn invoke(
        &self,
        savepoint: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &JobRow,
        context: JobContext,
    ) -> anyhow::Result<()> {
        match job.job.as_str() {
            JOB_NOTIFICATION => {
                let notification = queue::notification_of(job)?;
                let handler = self
                    .notification_handlers
                    .get(&(notification.resource.clone(), notification.operation))
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "no notification handler registered for {:?} {}",
                            notification.resource,
                            notification.operation
                        )
                    })?
                    .clone();
                let mut exec = JobExecution {
                    txn: &mut *savepoint,
                    pipeline: self,
                    context,
                };
                handler.notify(&mut exec, notification).await
            }
            JOB_EVENT => {
                let event = queue::event_of(job);
                let handler = self
                    .event_handlers
                    .get(&event.type_)
                    .ok_or_else(|| {
                        anyhow::anyhow!("no event handler registered for {:?}", event.type_)
                    })?
                    .clone();
                let mut exec = JobExecution {
                    txn: &mut *savepoint,
                    pipeline: self,
                    context,
                };
                handler.handle(&mut exec, event).await
            }
            other => anyhow::bail!("job {} has unknown kind {other:?}", job.serial),
        }
    }

    /// When the next attempt of a failed job becomes visible. Rate-limited
    /// events return to the rate schedule; everything else backs off by
    /// the per-attempt timeout sequence.
    fn retry_schedule(&self, job: &JobRow) -> DateTime<Utc> {
        if job.job == JOB_EVENT {
            if let Some(at) = self.schedule_for(&job.type_) {
                return at;
            }
        }

        let attempt = (self.max_attempts - job.attempts_left - 1).max(0) as usize;
        let delay = match self.retry_timeouts.as_slice() {
            [] => std::time::Duration::ZERO,
            timeouts => timeouts[attempt.min(timeouts.len() - 1)],
        };
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn retry_schedule_applies_backoff_sequence() {
        let builder = PipelineBuilder::new().max_attempts(4).retry_timeouts(vec![
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(2),
            std::time::Duration::from_secs(3),
        ]);
        // Only the back-off arithmetic is under test; the pool is never used.
        let pipeline = builder.build(
            sqlx::PgPool::connect_lazy("postgres://localhost/unused").unwrap(),
            "test",
        );

        let job = |attempts_left: i32| JobRow {
            serial: 1,
            job: JOB_NOTIFICATION.to_string(),
            type_: "create".to_string(),
            key: String::new(),
            resource: "fleet".to_string(),
            resource_id: uuid::Uuid::nil(),
            payload: None,
            attempts_left,
            context: serde_json::Value::Null,
        };

        for (attempts_left, expect_secs) in [(3, 1), (2, 2), (1, 3)] {
            let now = Utc::now();
            let at = pipeline.retry_schedule(&job(attempts_left));
            let delay = (at - now).num_milliseconds();
            assert!(
                (delay - expect_secs * 1000).abs() < 100,
                "attempts_left {attempts_left}: got {delay}ms"
            );
        }
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_notification_handler_is_fatal() {
        struct Nop;
        #[async_trait::async_trait]
        impl NotificationHandler for Nop {
            async fn notify(
                &self,
                _exec: &mut JobExecution<'_>,
                _notification: Notification,
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let _ = PipelineBuilder::new()
            .notification_handler("fleet", &[Operation::Create], Arc::new(Nop))
            .notification_handler("fleet", &[Operation::Create], Arc::new(Nop));
    }
}
