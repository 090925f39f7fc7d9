//! Append-only audit log. Resources opt in per operation through their
//! `audit_logs` configuration; a LIST call appends a single `read` entry.

use models::{Authorization, Operation, Resource};
use uuid::Uuid;

pub(crate) fn audit_table(schema: &str) -> String {
    format!("\"{schema}\".\"_audit_\"")
}

pub(crate) async fn ensure_audit_table(
    executor: &mut sqlx::PgConnection,
    schema: &str,
) -> sqlx::Result<()> {
    sqlx::query(&format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
  "serial" BIGSERIAL PRIMARY KEY,
  "resource" TEXT NOT NULL,
  "resource_id" UUID,
  "operation" TEXT NOT NULL,
  "authorization" JSONB NOT NULL DEFAULT '{{}}',
  "created_at" TIMESTAMPTZ NOT NULL DEFAULT now()
)"#,
        audit_table(schema)
    ))
    .execute(executor)
    .await?;
    Ok(())
}

/// Append one audit entry if the resource records `operation`. Reads of a
/// whole listing record `read`, once for the call.
pub(crate) async fn record(
    executor: &mut sqlx::PgConnection,
    schema: &str,
    resource: &Resource,
    resource_id: Option<Uuid>,
    operation: Operation,
    auth: &Authorization,
) -> sqlx::Result<()> {
    let audited = match operation {
        Operation::List => Operation::Read,
        other => other,
    };
    if !resource.audit_logs.contains(&audited) {
        return Ok(());
    }

    sqlx::query(&format!(
        r#"INSERT INTO {} ("resource", "resource_id", "operation", "authorization")
  VALUES ($1, $2, $3, $4)"#,
        audit_table(schema)
    ))
    .bind(&resource.path)
    .bind(resource_id)
    .bind(audited.as_str())
    .bind(sqlx::types::Json(auth))
    .execute(executor)
    .await?;
    Ok(())
}
