//! Handlers for collection resources, shared in large part by singletons
//! (whose singular alias resolves the item id from the parent) and
//! reused by the blob routes for metadata listings.

use super::{json_response, raw_json_response, RequestContext};
use crate::companion::object_key;
use crate::error::Error;
use crate::query::{self, SqlArg};
use crate::{audit, schema};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use models::{plural, Kind, Operation, Resource};
use sqlx::Row;
use uuid::Uuid;

pub(super) fn table_of(ctx: &RequestContext) -> String {
    schema::quoted(&ctx.core().schema, ctx.resource().table())
}

pub(super) fn map_write_error(err: sqlx::Error) -> Error {
    if let Some(db) = err.as_database_error() {
        if db.code().as_deref() == Some("23505") {
            let constraint = db.constraint().unwrap_or("unique index").to_string();
            return Error::ExternalIndexConflict(constraint);
        }
    }
    err.into()
}

pub(super) async fn fetch_item(
    executor: &mut sqlx::PgConnection,
    ctx: &RequestContext,
    id: Uuid,
    for_update: bool,
) -> Result<Option<sqlx::postgres::PgRow>, Error> {
    let table = table_of(ctx);
    let stmt = query::select_item(&table, ctx.resource(), &ctx.path_ids, id, for_update);
    Ok(query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_optional(executor)
        .await?)
}

/// Mirror the row's current image into the `<resource>_log` table. For
/// deletes this runs before the row goes away.
pub(super) async fn write_log(
    executor: &mut sqlx::PgConnection,
    ctx: &RequestContext,
    operation: Operation,
    id: Uuid,
) -> Result<(), Error> {
    let resource = ctx.resource();
    if !resource.with_log {
        return Ok(());
    }
    let columns = query::select_columns(resource, false)
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {log} (\"log_operation\", {columns}) SELECT $1, {columns} FROM {table} WHERE \"{pk}\" = $2",
        log = schema::quoted(&ctx.core().schema, &resource.log_table()),
        table = table_of(ctx),
        pk = resource.pk_column(),
    );
    sqlx::query(&sql)
        .bind(operation.as_str())
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(super) async fn notify(
    executor: &mut sqlx::PgConnection,
    ctx: &RequestContext,
    operation: Operation,
    resource_id: Uuid,
    payload: serde_json::Value,
) -> Result<(), Error> {
    let notification = jobs::Notification {
        resource: ctx.resource().path.clone(),
        operation,
        resource_id,
        payload,
    };
    ctx.core()
        .pipeline
        .enqueue_notification(executor, &notification, &ctx.job_context())
        .await?;
    Ok(())
}

pub(super) async fn record_audit(
    executor: &mut sqlx::PgConnection,
    ctx: &RequestContext,
    operation: Operation,
    resource_id: Option<Uuid>,
) -> Result<(), Error> {
    audit::record(
        executor,
        &ctx.core().schema,
        ctx.resource(),
        resource_id,
        operation,
        &ctx.auth,
    )
    .await?;
    Ok(())
}

/// Companion pre-signed URLs, attached to item responses of resources
/// configured with a companion file.
pub(super) async fn attach_companion_urls(
    ctx: &RequestContext,
    object: &mut serde_json::Map<String, serde_json::Value>,
    id: Uuid,
) -> Result<(), Error> {
    let resource = ctx.resource();
    if !resource.with_companion_file {
        return Ok(());
    }
    let Some(store) = &ctx.core().object_store else {
        return Ok(());
    };
    let key = object_key(resource, id);
    let validity = resource.companion_presigned_url_validity;
    let download = store
        .presigned_download_url(&key, validity)
        .await
        .map_err(Error::Storage)?;
    let upload = store
        .presigned_upload_url(&key, validity)
        .await
        .map_err(Error::Storage)?;
    object.insert("companion_download_url".to_string(), download.into());
    object.insert("companion_upload_url".to_string(), upload.into());
    Ok(())
}

/// Join the requested child collections into each listed object.
pub(super) async fn attach_children(
    executor: &mut sqlx::PgConnection,
    ctx: &RequestContext,
    children: &[String],
    objects: &mut [serde_json::Map<String, serde_json::Value>],
) -> Result<(), Error> {
    let core = ctx.core();
    let resource = ctx.resource();
    let pk = resource.pk_column();

    let parent_ids: Vec<Uuid> = objects
        .iter()
        .filter_map(|o| o.get(&pk).and_then(|v| v.as_str()))
        .filter_map(|raw| raw.parse().ok())
        .collect();

    for spec in children {
        let child = core
            .catalog
            .children_of(&resource.path)
            .find(|c| c.kind == Kind::Collection && (c.path == *spec || c.this() == spec))
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown child resource {spec:?}")))?;

        let columns = query::select_columns(&child, false)
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE \"{pk}\" = ANY($1) ORDER BY \"timestamp\" DESC, \"{child_pk}\" DESC",
            table = schema::quoted(&core.schema, child.table()),
            child_pk = child.pk_column(),
        );
        let rows = sqlx::query(&sql)
            .bind(&parent_ids)
            .fetch_all(&mut *executor)
            .await?;

        let mut grouped: std::collections::HashMap<String, Vec<serde_json::Value>> =
            std::collections::HashMap::new();
        for row in rows {
            let object = query::row_to_object(&child, &row, false)?;
            let parent = object
                .get(&pk)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            grouped
                .entry(parent)
                .or_default()
                .push(serde_json::Value::Object(object));
        }

        let key = plural(child.this());
        for object in objects.iter_mut() {
            let own = object.get(&pk).and_then(|v| v.as_str()).unwrap_or_default();
            let attached = grouped.remove(own).unwrap_or_default();
            object.insert(key.clone(), serde_json::Value::Array(attached));
        }
    }
    Ok(())
}

pub(super) async fn list(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::List)?;
    let params = ctx.list_params()?;
    let resource = ctx.resource();
    let table = table_of(ctx);

    let mut conn = ctx.core().pool.acquire().await?;

    let stmt = query::select_list(&table, resource, &ctx.path_ids, &params)?;
    let rows = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_all(&mut *conn)
        .await?;

    let mut headers = HeaderMap::new();
    append_header(&mut headers, query::HEADER_PAGINATION_LIMIT, params.limit);

    let mut rows = rows;
    if params.page.is_some() {
        let count_stmt = query::select_count(&table, resource, &ctx.path_ids, &params)?;
        let total: i64 = query::bind_args(sqlx::query(&count_stmt.sql), &count_stmt.args)
            .fetch_one(&mut *conn)
            .await?
            .try_get("count")
            .map_err(anyhow::Error::from)?;
        let pages = (total + params.limit - 1) / params.limit;
        append_header(&mut headers, query::HEADER_PAGINATION_TOTAL_COUNT, total);
        append_header(&mut headers, query::HEADER_PAGINATION_PAGE_COUNT, pages);
        append_header(
            &mut headers,
            query::HEADER_PAGINATION_CURRENT_PAGE,
            params.page.unwrap_or(1),
        );
    } else {
        // Cursor mode fetched one extra row to detect more data.
        if rows.len() as i64 > params.limit {
            rows.truncate(params.limit as usize);
            if let Some(last) = rows.last() {
                let cursor = query::Cursor {
                    timestamp: last.try_get("timestamp").map_err(anyhow::Error::from)?,
                    id: last
                        .try_get(resource.pk_column().as_str())
                        .map_err(anyhow::Error::from)?,
                };
                if let Ok(value) = HeaderValue::from_str(&cursor.encode()) {
                    headers.insert(query::HEADER_PAGINATION_NEXT_TOKEN, value);
                }
            }
        }
    }

    let mut objects = rows
        .iter()
        .map(|row| query::row_to_object(resource, row, params.only_meta))
        .collect::<Result<Vec<_>, _>>()?;

    if !params.children.is_empty() && !params.only_meta {
        attach_children(&mut conn, ctx, &params.children, &mut objects).await?;
    }

    record_audit(&mut conn, ctx, Operation::List, None).await?;

    let value =
        serde_json::Value::Array(objects.into_iter().map(serde_json::Value::Object).collect());
    if params.no_intercept {
        return json_response(&ctx.headers, headers, &value);
    }
    let body = serde_json::to_vec(&value)
        .map_err(|err| Error::Storage(anyhow::anyhow!("response encoding failed: {err}")))?;
    let body = ctx.intercept(Operation::List, body).await?;
    raw_json_response(&ctx.headers, headers, body)
}

pub(super) async fn read(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Read)?;
    let params = ctx.list_params()?;
    let id = ctx.item_id()?;

    let mut conn = ctx.core().pool.acquire().await?;
    let Some(row) = fetch_item(&mut conn, ctx, id, false).await? else {
        return Err(Error::NotFound);
    };
    let mut object = query::row_to_object(ctx.resource(), &row, false)?;
    attach_companion_urls(ctx, &mut object, id).await?;

    if !params.children.is_empty() {
        let mut objects = vec![object];
        attach_children(&mut conn, ctx, &params.children, &mut objects).await?;
        object = objects.pop().expect("one object in, one out");
    }

    record_audit(&mut conn, ctx, Operation::Read, Some(id)).await?;

    let value = serde_json::Value::Object(object);
    if params.no_intercept {
        return json_response(&ctx.headers, HeaderMap::new(), &value);
    }
    let body = serde_json::to_vec(&value)
        .map_err(|err| Error::Storage(anyhow::anyhow!("response encoding failed: {err}")))?;
    let body = ctx.intercept(Operation::Read, body).await?;
    raw_json_response(&ctx.headers, HeaderMap::new(), body)
}

pub(super) async fn create(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Create)?;

    let body = ctx.intercept(Operation::Create, ctx.body.to_vec()).await?;
    let body = RequestContext::json_object(&body)?;
    let record = query::decompose(ctx.resource(), &body, &ctx.path_ids)?;
    ctx.core().validate_schema(ctx.resource(), &body)?;

    let table = table_of(ctx);
    let mut txn = ctx.core().pool.begin().await?;

    let stmt = query::insert_row(&table, ctx.resource(), &record);
    let row = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_one(&mut *txn)
        .await
        .map_err(map_write_error)?;
    let mut object = query::row_to_object(ctx.resource(), &row, false)?;

    write_log(&mut txn, ctx, Operation::Create, record.id).await?;
    record_audit(&mut txn, ctx, Operation::Create, Some(record.id)).await?;
    notify(
        &mut txn,
        ctx,
        Operation::Create,
        record.id,
        serde_json::Value::Object(object.clone()),
    )
    .await?;
    txn.commit().await?;
    ctx.core().pipeline.trigger();

    attach_companion_urls(ctx, &mut object, record.id).await?;
    Ok((StatusCode::OK, axum::Json(serde_json::Value::Object(object))).into_response())
}

/// Create-or-update one object. `forced_id` pins the primary key of item
/// routes; `merge` overlays the body onto the existing object (PATCH).
pub(super) async fn write_object(
    ctx: &RequestContext,
    body: serde_json::Map<String, serde_json::Value>,
    forced_id: Option<Uuid>,
    merge: bool,
) -> Result<serde_json::Map<String, serde_json::Value>, Error> {
    let resource = ctx.resource();
    let table = table_of(ctx);
    let core = ctx.core();
    let pk = resource.pk_column();

    // Pin down the write target: the path id, the body id, or an
    // existing row matched through the external index.
    let body_id = match body.get(&pk).and_then(|v| v.as_str()) {
        Some(raw) => {
            let id: Uuid = raw
                .parse()
                .map_err(|_| Error::validation(format!("invalid {pk} {raw:?}")))?;
            (!id.is_nil()).then_some(id)
        }
        None => None,
    };
    if let (Some(forced), Some(given)) = (forced_id, body_id) {
        if forced != given {
            return Err(Error::validation("cannot change primary id"));
        }
    }

    let mut txn = core.pool.begin().await?;

    let target_id = match (forced_id, body_id) {
        (Some(id), _) => Some(id),
        (None, Some(id)) => Some(id),
        (None, None) => match &resource.external_index {
            Some(index) => match body.get(index).and_then(|v| v.as_str()) {
                Some(value) => {
                    let sql = format!(
                        "SELECT \"{pk}\" FROM {table} WHERE \"{index}\" = $1 FOR UPDATE"
                    );
                    sqlx::query(&sql)
                        .bind(value)
                        .fetch_optional(&mut *txn)
                        .await?
                        .map(|row| row.try_get(pk.as_str()))
                        .transpose()
                        .map_err(anyhow::Error::from)?
                }
                None => None,
            },
            None => None,
        },
    };

    let existing = match target_id {
        Some(id) => fetch_item(&mut txn, ctx, id, true).await?,
        None => None,
    };

    let (object, id, operation) = match existing {
        Some(row) => {
            let current = query::row_to_object(resource, &row, false)?;
            let id = target_id.expect("existing row implies a target id");

            let effective = if merge {
                let mut merged = current.clone();
                for (key, value) in &body {
                    merged.insert(key.clone(), value.clone());
                }
                merged
            } else {
                let mut body = body;
                body.insert(pk.clone(), serde_json::Value::String(id.to_string()));
                // Ancestors absent from the body (wildcard path segments)
                // resolve through the existing row.
                for column in resource.ancestor_pk_columns() {
                    if !body.contains_key(&column) {
                        if let Some(value) = current.get(&column) {
                            body.insert(column, value.clone());
                        }
                    }
                }
                body
            };

            let mut record = query::decompose(resource, &effective, &ctx.path_ids)?;
            record.id = id;
            core.validate_schema(resource, &effective)?;

            // Optimistic concurrency: a non-zero revision must match.
            let current_revision = current
                .get("revision")
                .and_then(|v| v.as_i64())
                .unwrap_or_default() as i32;
            if record.revision != 0 && record.revision != current_revision {
                return Err(Error::RevisionConflict {
                    current: serde_json::Value::Object(current),
                });
            }

            let stmt = query::update_row(&table, resource, &record);
            let row = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
                .fetch_one(&mut *txn)
                .await
                .map_err(map_write_error)?;
            (
                query::row_to_object(resource, &row, false)?,
                id,
                Operation::Update,
            )
        }
        None => {
            let mut record = query::decompose(resource, &body, &ctx.path_ids)?;
            if let Some(id) = target_id {
                record.id = id;
            }
            core.validate_schema(resource, &body)?;

            let stmt = query::insert_row(&table, resource, &record);
            let row = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
                .fetch_one(&mut *txn)
                .await
                .map_err(map_write_error)?;
            (
                query::row_to_object(resource, &row, false)?,
                record.id,
                Operation::Create,
            )
        }
    };

    write_log(&mut txn, ctx, operation, id).await?;
    record_audit(&mut txn, ctx, operation, Some(id)).await?;
    notify(
        &mut txn,
        ctx,
        operation,
        id,
        serde_json::Value::Object(object.clone()),
    )
    .await?;
    txn.commit().await?;
    core.pipeline.trigger();

    let mut object = object;
    attach_companion_urls(ctx, &mut object, id).await?;
    Ok(object)
}

pub(super) async fn upsert(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Update)?;
    let body = ctx.intercept(Operation::Update, ctx.body.to_vec()).await?;
    let body = RequestContext::json_object(&body)?;

    // A singleton's primary key is always its parent's id, also through
    // the collection form.
    let forced_id = if ctx.resource().kind == Kind::Singleton {
        let parent = ctx
            .resource()
            .ancestor_pk_columns()
            .last()
            .and_then(|column| ctx.path_ids.get(column))
            .copied()
            .flatten();
        match parent {
            Some(id) => Some(id),
            None => {
                return Err(Error::validation(
                    "singleton routes require a concrete parent id",
                ))
            }
        }
    } else {
        None
    };

    let object = write_object(ctx, body, forced_id, false).await?;
    Ok((StatusCode::OK, axum::Json(serde_json::Value::Object(object))).into_response())
}

pub(super) async fn put(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Update)?;
    let id = ctx.item_id()?;
    let body = ctx.intercept(Operation::Update, ctx.body.to_vec()).await?;
    let body = RequestContext::json_object(&body)?;
    let object = write_object(ctx, body, Some(id), false).await?;
    Ok((StatusCode::OK, axum::Json(serde_json::Value::Object(object))).into_response())
}

pub(super) async fn patch(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Update)?;
    let id = ctx.item_id()?;
    let body = ctx.intercept(Operation::Update, ctx.body.to_vec()).await?;
    let body = RequestContext::json_object(&body)?;
    let object = write_object(ctx, body, Some(id), true).await?;
    Ok((StatusCode::OK, axum::Json(serde_json::Value::Object(object))).into_response())
}

/// Bulk create-or-update: a JSON array of objects, each upserted with
/// merge semantics.
pub(super) async fn bulk_patch(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Update)?;
    let body = ctx.intercept(Operation::Update, ctx.body.to_vec()).await?;
    let elements: Vec<serde_json::Value> = match serde_json::from_slice(&body) {
        Ok(serde_json::Value::Array(elements)) => elements,
        Ok(_) => return Err(Error::validation("request body must be a JSON array")),
        Err(err) => return Err(Error::validation(format!("invalid JSON body: {err}"))),
    };

    let mut results = Vec::with_capacity(elements.len());
    for element in elements {
        let serde_json::Value::Object(object) = element else {
            return Err(Error::validation("array elements must be JSON objects"));
        };
        let written = write_object(ctx, object, None, true).await?;
        results.push(serde_json::Value::Object(written));
    }
    Ok((StatusCode::OK, axum::Json(serde_json::Value::Array(results))).into_response())
}

/// Fast static-property update: writes the single column and bumps
/// `revision`, never touching the properties document.
pub(super) async fn fast_put(ctx: &RequestContext, property: &str) -> Result<Response, Error> {
    ctx.authorize(Operation::Update)?;
    let id = ctx.item_id()?;
    let value = ctx
        .path_params
        .get("value")
        .cloned()
        .ok_or_else(|| Error::validation("missing value segment"))?;

    let resource = ctx.resource();
    let table = table_of(ctx);
    let mut stmt = query::Statement::default();
    let value_arg = stmt.bind(SqlArg::Text(value));
    let id_arg = stmt.bind(SqlArg::Uuid(id));
    stmt.sql = format!(
        "UPDATE {table} SET \"{property}\" = {value_arg}, \"revision\" = \"revision\" + 1 WHERE \"{pk}\" = {id_arg}",
        pk = resource.pk_column(),
    );
    for column in resource.ancestor_pk_columns() {
        if let Some(Some(ancestor)) = ctx.path_ids.get(&column) {
            let arg = stmt.bind(SqlArg::Uuid(*ancestor));
            stmt.sql.push_str(&format!(" AND \"{column}\" = {arg}"));
        }
    }
    stmt.sql.push_str(&format!(
        " RETURNING {}",
        query::select_columns(resource, false)
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ")
    ));

    let mut txn = ctx.core().pool.begin().await?;
    let Some(row) = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_optional(&mut *txn)
        .await?
    else {
        return Err(Error::NotFound);
    };
    let object = query::row_to_object(resource, &row, false)?;

    write_log(&mut txn, ctx, Operation::Update, id).await?;
    record_audit(&mut txn, ctx, Operation::Update, Some(id)).await?;
    notify(
        &mut txn,
        ctx,
        Operation::Update,
        id,
        serde_json::Value::Object(object),
    )
    .await?;
    txn.commit().await?;
    ctx.core().pipeline.trigger();

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Delete one row and, depth-first, every descendant row below it. One
/// delete notification is enqueued per removed row with a registered
/// handler.
pub(super) async fn delete(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Delete)?;
    ctx.intercept(Operation::Delete, Vec::new()).await?;
    let id = ctx.item_id()?;
    let resource = ctx.resource();

    let mut txn = ctx.core().pool.begin().await?;
    let Some(row) = fetch_item(&mut txn, ctx, id, true).await? else {
        return Err(Error::NotFound);
    };
    let object = query::row_to_object(resource, &row, false)?;

    let mut cleanup = cascade_descendants(&mut txn, ctx, &[id], true).await?;

    write_log(&mut txn, ctx, Operation::Delete, id).await?;
    record_audit(&mut txn, ctx, Operation::Delete, Some(id)).await?;
    sqlx::query(&format!(
        "DELETE FROM {} WHERE \"{}\" = $1",
        table_of(ctx),
        resource.pk_column()
    ))
    .bind(id)
    .execute(&mut *txn)
    .await?;
    notify(
        &mut txn,
        ctx,
        Operation::Delete,
        id,
        serde_json::Value::Object(object),
    )
    .await?;

    if needs_store_cleanup(resource) {
        cleanup.push(object_key(resource, id));
    }
    txn.commit().await?;
    ctx.core().pipeline.trigger();
    delete_stored_objects(ctx, cleanup).await;

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Clear a collection: delete every row in scope and their descendants.
/// A single `clear` notification carries the removed row count.
pub(super) async fn clear(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Clear)?;
    ctx.intercept(Operation::Clear, Vec::new()).await?;
    let resource = ctx.resource();
    let table = table_of(ctx);

    let mut txn = ctx.core().pool.begin().await?;

    // Rows in scope, locked for the cascade below.
    let mut stmt = query::Statement::new(format!(
        "SELECT \"{}\" FROM {table}",
        resource.pk_column()
    ));
    let mut conditions = Vec::new();
    for column in resource.ancestor_pk_columns() {
        if let Some(Some(ancestor)) = ctx.path_ids.get(&column) {
            let arg = stmt.bind(SqlArg::Uuid(*ancestor));
            conditions.push(format!("\"{column}\" = {arg}"));
        }
    }
    if !conditions.is_empty() {
        stmt.push(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    stmt.push(" FOR UPDATE");
    let ids: Vec<Uuid> = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_all(&mut *txn)
        .await?
        .iter()
        .map(|row| row.try_get(resource.pk_column().as_str()))
        .collect::<Result<_, _>>()
        .map_err(anyhow::Error::from)?;

    let mut cleanup = cascade_descendants(&mut txn, ctx, &ids, false).await?;
    if needs_store_cleanup(resource) {
        cleanup.extend(ids.iter().map(|id| object_key(resource, *id)));
    }

    if !ids.is_empty() {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE \"{}\" = ANY($1)",
            resource.pk_column()
        ))
        .bind(&ids)
        .execute(&mut *txn)
        .await?;
    }

    record_audit(&mut txn, ctx, Operation::Clear, None).await?;
    notify(
        &mut txn,
        ctx,
        Operation::Clear,
        Uuid::nil(),
        serde_json::json!({"count": ids.len()}),
    )
    .await?;
    txn.commit().await?;
    ctx.core().pipeline.trigger();
    delete_stored_objects(ctx, cleanup).await;

    Ok(StatusCode::NO_CONTENT.into_response())
}

fn needs_store_cleanup(resource: &Resource) -> bool {
    resource.with_companion_file || (resource.kind == Kind::Blob && resource.external)
}

/// Delete all descendant rows of the given parents, deepest resources
/// first, optionally enqueueing one delete notification per row.
pub(super) async fn cascade_descendants(
    txn: &mut sqlx::PgConnection,
    ctx: &RequestContext,
    parent_ids: &[Uuid],
    per_row_notifications: bool,
) -> Result<Vec<String>, Error> {
    let core = ctx.core();
    let parent_pk = ctx.resource().pk_column();
    let mut cleanup = Vec::new();
    if parent_ids.is_empty() {
        return Ok(cleanup);
    }

    for descendant in core.catalog.descendants_leaves_first(&ctx.resource().path) {
        let table = schema::quoted(&core.schema, descendant.table());
        if descendant.with_log {
            let columns = query::select_columns(descendant, false)
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query(&format!(
                "INSERT INTO {log} (\"log_operation\", {columns}) SELECT 'delete', {columns} FROM {table} WHERE \"{parent_pk}\" = ANY($1)",
                log = schema::quoted(&core.schema, &descendant.log_table()),
            ))
            .bind(parent_ids)
            .execute(&mut *txn)
            .await?;
        }

        let columns = query::select_columns(descendant, false)
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            "DELETE FROM {table} WHERE \"{parent_pk}\" = ANY($1) RETURNING {columns}"
        ))
        .bind(parent_ids)
        .fetch_all(&mut *txn)
        .await?;

        for row in rows {
            let object = query::row_to_object(descendant, &row, false)?;
            let id: Uuid = row
                .try_get(descendant.pk_column().as_str())
                .map_err(anyhow::Error::from)?;
            if needs_store_cleanup(descendant) {
                cleanup.push(object_key(descendant, id));
            }
            if per_row_notifications {
                let notification = jobs::Notification {
                    resource: descendant.path.clone(),
                    operation: Operation::Delete,
                    resource_id: id,
                    payload: serde_json::Value::Object(object),
                };
                core.pipeline
                    .enqueue_notification(&mut *txn, &notification, &ctx.job_context())
                    .await?;
            }
        }
    }
    Ok(cleanup)
}

/// Best-effort removal of externally stored payloads after commit.
pub(super) async fn delete_stored_objects(ctx: &RequestContext, keys: Vec<String>) {
    let Some(store) = &ctx.core().object_store else {
        return;
    };
    for key in keys {
        if let Err(err) = store.delete(&key).await {
            tracing::warn!(?err, key, "failed to delete stored object");
        }
    }
}

fn append_header(headers: &mut HeaderMap, name: &'static str, value: i64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}
