//! Schema manager: derives the SQL schema from the resource catalog.
//! All DDL is idempotent, so `ensure_schema` doubles as migration when
//! the configuration gains resources or properties.

use models::{Catalog, Kind, Resource};

pub(crate) fn quoted(schema: &str, table: &str) -> String {
    format!("\"{schema}\".\"{table}\"")
}

#[tracing::instrument(skip_all, fields(schema = %schema))]
pub async fn ensure_schema(
    pool: &sqlx::PgPool,
    schema: &str,
    catalog: &Catalog,
) -> sqlx::Result<()> {
    let mut conn = pool.acquire().await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
        .execute(&mut *conn)
        .await?;

    // The catalog is ordered parent-before-child.
    for resource in catalog.resources() {
        ensure_resource_table(&mut conn, schema, resource).await?;
        tracing::debug!(resource = %resource.path, "ensured resource table");
    }

    for relation in catalog.relations() {
        let left = catalog.resource(&relation.left).expect("validated");
        let right = catalog.resource(&relation.right).expect("validated");
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
  "{left_pk}" UUID NOT NULL,
  "{right_pk}" UUID NOT NULL,
  PRIMARY KEY ("{left_pk}", "{right_pk}")
)"#,
            quoted(schema, &relation.table()),
            left_pk = left.pk_column(),
            right_pk = right.pk_column(),
        ))
        .execute(&mut *conn)
        .await?;
    }

    jobs::ensure_job_table(&mut conn, schema).await?;
    crate::audit::ensure_audit_table(&mut conn, schema).await?;

    Ok(())
}

/// Drop the backend's schema and everything in it. For tests.
pub async fn clear_schema(pool: &sqlx::PgPool, schema: &str) -> sqlx::Result<()> {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
        .execute(pool)
        .await?;
    Ok(())
}

async fn ensure_resource_table(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    resource: &Resource,
) -> sqlx::Result<()> {
    let table = quoted(schema, resource.table());
    let sanitized = resource.sanitized();

    let mut columns = vec![format!(
        "\"{}\" UUID PRIMARY KEY DEFAULT gen_random_uuid()",
        resource.pk_column()
    )];
    for ancestor in resource.ancestor_pk_columns() {
        columns.push(format!("\"{ancestor}\" UUID NOT NULL"));
    }
    columns.push("\"timestamp\" TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());
    columns.push("\"revision\" INTEGER NOT NULL DEFAULT 0".to_string());
    columns.push("\"properties\" JSONB NOT NULL DEFAULT '{}'".to_string());
    for property in resource.property_columns() {
        columns.push(format!("\"{property}\" TEXT"));
    }
    if resource.kind == Kind::Blob {
        columns.push("\"content_type\" TEXT NOT NULL DEFAULT ''".to_string());
        columns.push("\"data\" BYTEA".to_string());
        columns.push("\"meta_data\" JSONB NOT NULL DEFAULT '{}'".to_string());
    }

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n  {}\n)",
        columns.join(",\n  ")
    ))
    .execute(&mut *conn)
    .await?;

    // Properties added to an existing configuration arrive as new columns.
    for property in resource.property_columns() {
        sqlx::query(&format!(
            "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS \"{property}\" TEXT"
        ))
        .execute(&mut *conn)
        .await?;
    }

    if let Some(external_index) = &resource.external_index {
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"{sanitized}_{external_index}_key\" ON {table} (\"{external_index}\")"
        ))
        .execute(&mut *conn)
        .await?;
    }
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS \"{sanitized}_timestamp_idx\" ON {table} (\"timestamp\")"
    ))
    .execute(&mut *conn)
    .await?;
    for property in &resource.searchable_properties {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"{sanitized}_{property}_idx\" ON {table} (\"{property}\")"
        ))
        .execute(&mut *conn)
        .await?;
    }
    if let Some(parent) = resource.ancestor_pk_columns().last() {
        // Pagination within a parent walks (parent, timestamp).
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"{sanitized}_{parent}_timestamp_idx\" ON {table} (\"{parent}\", \"timestamp\")"
        ))
        .execute(&mut *conn)
        .await?;
    }

    if resource.with_log {
        let mut log_columns = vec![
            "\"log_serial\" BIGSERIAL PRIMARY KEY".to_string(),
            "\"log_operation\" TEXT NOT NULL".to_string(),
            "\"log_created_at\" TIMESTAMPTZ NOT NULL DEFAULT now()".to_string(),
            format!("\"{}\" UUID NOT NULL", resource.pk_column()),
        ];
        for ancestor in resource.ancestor_pk_columns() {
            log_columns.push(format!("\"{ancestor}\" UUID NOT NULL"));
        }
        log_columns.push("\"timestamp\" TIMESTAMPTZ NOT NULL".to_string());
        log_columns.push("\"revision\" INTEGER NOT NULL".to_string());
        log_columns.push("\"properties\" JSONB NOT NULL DEFAULT '{}'".to_string());
        for property in resource.property_columns() {
            log_columns.push(format!("\"{property}\" TEXT"));
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            quoted(schema, &resource.log_table()),
            log_columns.join(",\n  ")
        ))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}
