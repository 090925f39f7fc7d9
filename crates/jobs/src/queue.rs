use crate::{Event, JobContext, Notification};
use chrono::{DateTime, Utc};
use models::Operation;
use sqlx::Row;
use uuid::Uuid;

/// Job kind discriminators in the `job` column.
pub(crate) const JOB_NOTIFICATION: &str = "notification";
pub(crate) const JOB_EVENT: &str = "event";

fn job_table(schema: &str) -> String {
    format!("\"{schema}\".\"_job_\"")
}

/// Create the `_job_` table and its partial unique compression index.
/// Idempotent; the backend's schema manager calls this at startup.
pub async fn ensure_job_table(
    executor: &mut sqlx::PgConnection,
    schema: &str,
) -> sqlx::Result<()> {
    let table = job_table(schema);
    sqlx::query(&format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
  "serial" BIGSERIAL PRIMARY KEY,
  "job" TEXT NOT NULL,
  "type" TEXT NOT NULL DEFAULT '',
  "key" TEXT NOT NULL DEFAULT '',
  "resource" TEXT NOT NULL DEFAULT '',
  "resource_id" UUID NOT NULL DEFAULT '00000000-0000-0000-0000-000000000000',
  "payload" JSONB,
  "created_at" TIMESTAMPTZ NOT NULL DEFAULT now(),
  "scheduled_at" TIMESTAMPTZ,
  "attempts_left" INTEGER NOT NULL,
  "context" JSONB NOT NULL DEFAULT '{{}}'
)"#
    ))
    .execute(&mut *executor)
    .await?;

    sqlx::query(&format!(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS "{schema}_job_event_compression"
  ON {table} ("type", "key", "resource", "resource_id") WHERE "job" = '{JOB_EVENT}'"#
    ))
    .execute(&mut *executor)
    .await?;

    Ok(())
}

/// One row per notification; notifications never collide.
pub(crate) async fn enqueue_notification(
    executor: &mut sqlx::PgConnection,
    schema: &str,
    notification: &Notification,
    attempts: i32,
    context: &JobContext,
) -> sqlx::Result<()> {
    sqlx::query(&format!(
        r#"INSERT INTO {} ("job", "type", "resource", "resource_id", "payload", "attempts_left", "context")
  VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        job_table(schema)
    ))
    .bind(JOB_NOTIFICATION)
    .bind(notification.operation.as_str())
    .bind(&notification.resource)
    .bind(notification.resource_id)
    .bind(&notification.payload)
    .bind(attempts)
    .bind(sqlx::types::Json(context))
    .execute(executor)
    .await?;
    Ok(())
}

/// Upsert keyed on the partial unique index: a later enqueue of the same
/// logical event replaces payload, schedule, attempts and context.
pub(crate) async fn enqueue_event(
    executor: &mut sqlx::PgConnection,
    schema: &str,
    event: &Event,
    scheduled_at: Option<DateTime<Utc>>,
    attempts: i32,
    context: &JobContext,
) -> sqlx::Result<()> {
    sqlx::query(&format!(
        r#"INSERT INTO {} ("job", "type", "key", "resource", "resource_id", "payload", "scheduled_at", "attempts_left", "context")
  VALUES ('{JOB_EVENT}', $1, $2, $3, $4, $5, $6, $7, $8)
  ON CONFLICT ("type", "key", "resource", "resource_id") WHERE "job" = '{JOB_EVENT}'
  DO UPDATE SET
    "payload" = EXCLUDED."payload",
    "created_at" = now(),
    "scheduled_at" = EXCLUDED."scheduled_at",
    "attempts_left" = EXCLUDED."attempts_left",
    "context" = EXCLUDED."context""#,
        job_table(schema)
    ))
    .bind(&event.type_)
    .bind(&event.key)
    .bind(&event.resource)
    .bind(event.resource_id)
    .bind(&event.payload)
    .bind(scheduled_at)
    .bind(attempts)
    .bind(sqlx::types::Json(context))
    .execute(executor)
    .await?;
    Ok(())
}

/// A job claimed by the dispatch loop. `attempts_left` is the value after
/// the claim's decrement.
#[derive(Debug)]
pub(crate) struct JobRow {
    pub serial: i64,
    pub job: String,
    pub type_: String,
    pub key: String,
    pub resource: String,
    pub resource_id: Uuid,
    pub payload: Option<serde_json::Value>,
    pub attempts_left: i32,
    pub context: serde_json::Value,
}

/// Claim the next due job within the caller's transaction. The decrement
/// and row lock are held until that transaction completes; `SKIP LOCKED`
/// keeps concurrent claimers from blocking on each other.
pub(crate) async fn pick(
    executor: &mut sqlx::PgConnection,
    schema: &str,
) -> sqlx::Result<Option<JobRow>> {
    let table = job_table(schema);
    let row = sqlx::query(&format!(
        r#"UPDATE {table} SET "attempts_left" = "attempts_left" - 1
  WHERE "serial" = (
    SELECT "serial" FROM {table}
      WHERE "attempts_left" > 0
        AND ("scheduled_at" IS NULL OR now() > "scheduled_at")
      ORDER BY "attempts_left", "serial"
      FOR UPDATE SKIP LOCKED
      LIMIT 1)
  RETURNING "serial", "job", "type", "key", "resource", "resource_id", "payload", "attempts_left", "context""#
    ))
    .fetch_optional(executor)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(JobRow {
        serial: row.try_get("serial")?,
        job: row.try_get("job")?,
        type_: row.try_get("type")?,
        key: row.try_get("key")?,
        resource: row.try_get("resource")?,
        resource_id: row.try_get("resource_id")?,
        payload: row.try_get("payload")?,
        attempts_left: row.try_get("attempts_left")?,
        context: row.try_get("context")?,
    }))
}

pub(crate) async fn delete(
    executor: &mut sqlx::PgConnection,
    schema: &str,
    serial: i64,
) -> sqlx::Result<()> {
    sqlx::query(&format!(
        r#"DELETE FROM {} WHERE "serial" = $1"#,
        job_table(schema)
    ))
    .bind(serial)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn reschedule(
    executor: &mut sqlx::PgConnection,
    schema: &str,
    serial: i64,
    at: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(&format!(
        r#"UPDATE {} SET "scheduled_at" = $2 WHERE "serial" = $1"#,
        job_table(schema)
    ))
    .bind(serial)
    .bind(at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Number of jobs eligible for dispatch right now.
pub(crate) async fn ready_count(pool: &sqlx::PgPool, schema: &str) -> sqlx::Result<i64> {
    let row = sqlx::query(&format!(
        r#"SELECT count(*) AS "count" FROM {}
  WHERE "attempts_left" > 0 AND ("scheduled_at" IS NULL OR now() > "scheduled_at")"#,
        job_table(schema)
    ))
    .fetch_one(pool)
    .await?;
    row.try_get("count")
}

/// A job whose delivery attempts are exhausted. The row is retained for
/// inspection through the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedJob {
    pub serial: i64,
    pub job: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub key: String,
    pub resource: String,
    pub resource_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub attempts_left: i32,
}

pub(crate) async fn failed_jobs(pool: &sqlx::PgPool, schema: &str) -> sqlx::Result<Vec<FailedJob>> {
    let rows = sqlx::query(&format!(
        r#"SELECT "serial", "job", "type", "key", "resource", "resource_id", "created_at", "attempts_left"
  FROM {} WHERE "attempts_left" = 0 ORDER BY "serial""#,
        job_table(schema)
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(FailedJob {
                serial: row.try_get("serial")?,
                job: row.try_get("job")?,
                type_: row.try_get("type")?,
                key: row.try_get("key")?,
                resource: row.try_get("resource")?,
                resource_id: row.try_get("resource_id")?,
                created_at: row.try_get("created_at")?,
                attempts_left: row.try_get("attempts_left")?,
            })
        })
        .collect()
}

pub(crate) fn notification_of(row: &JobRow) -> anyhow::Result<Notification> {
    let operation: Operation = row
        .type_
        .parse()
        .map_err(|err| anyhow::anyhow!("job {}: {err}", row.serial))?;
    Ok(Notification {
        resource: row.resource.clone(),
        operation,
        resource_id: row.resource_id,
        payload: row.payload.clone().unwrap_or(serde_json::Value::Null),
    })
}

pub(crate) fn event_of(row: &JobRow) -> Event {
    Event {
        type_: row.type_.clone(),
        key: row.key.clone(),
        resource: row.resource.clone(),
        resource_id: row.resource_id,
        payload: row.payload.clone().unwrap_or(serde_json::Value::Null),
    }
}
