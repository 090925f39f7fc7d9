//! Blob resources: binary payloads served with their original content
//! type, declared properties as canonical headers, and a JSON meta-data
//! header. Payloads live in the blob table or, for blobs declared
//! `external`, in the object store.

use super::{collection, json_response, RequestContext};
use crate::companion::object_key;
use crate::error::Error;
use crate::etag;
use crate::query::{self, SqlArg};
use axum::http::header::{CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use models::Operation;
use sqlx::Row;
use uuid::Uuid;

pub(super) const META_DATA_HEADER: &str = "Kurbisio-Meta-Data";

/// Canonical header name of a declared property: `serial_number`
/// becomes `Serial-Number`.
pub(super) fn canonical_header(property: &str) -> String {
    property
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn blob_columns(ctx: &RequestContext) -> Vec<String> {
    let mut columns = query::select_columns(ctx.resource(), false);
    columns.push("content_type".to_string());
    columns.push("meta_data".to_string());
    columns
}

fn selected_columns(ctx: &RequestContext) -> String {
    blob_columns(ctx)
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn blob_object(
    ctx: &RequestContext,
    row: &sqlx::postgres::PgRow,
) -> Result<serde_json::Map<String, serde_json::Value>, Error> {
    let mut object = query::row_to_object(ctx.resource(), row, false)?;
    let content_type: String = row.try_get("content_type").map_err(anyhow::Error::from)?;
    let meta_data: serde_json::Value = row.try_get("meta_data").map_err(anyhow::Error::from)?;
    object.insert("content_type".to_string(), content_type.into());
    object.insert("meta_data".to_string(), meta_data);
    Ok(object)
}

/// The JSON meta-data header value: stored meta-data augmented with at
/// least the blob id, timestamp and content type.
fn meta_header_value(
    resource: &models::Resource,
    object: &serde_json::Map<String, serde_json::Value>,
    id: Uuid,
) -> serde_json::Map<String, serde_json::Value> {
    let mut meta = match object.get("meta_data") {
        Some(serde_json::Value::Object(meta)) => meta.clone(),
        _ => serde_json::Map::new(),
    };
    meta.insert("blob_id".to_string(), id.to_string().into());
    meta.insert(
        resource.pk_column(),
        object
            .get(&resource.pk_column())
            .cloned()
            .unwrap_or_default(),
    );
    for key in ["timestamp", "content_type"] {
        if let Some(value) = object.get(key) {
            meta.insert(key.to_string(), value.clone());
        }
    }
    meta
}

/// Read declared properties and meta-data from the request headers.
fn properties_from_headers(
    ctx: &RequestContext,
) -> Result<(Vec<(String, Option<String>)>, serde_json::Value), Error> {
    let resource = ctx.resource();
    let mut columns = Vec::new();
    for property in resource.property_columns() {
        let value = ctx
            .headers
            .get(canonical_header(property))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        columns.push((property.to_string(), value));
    }

    let meta_data = match ctx.headers.get(META_DATA_HEADER) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| Error::validation("invalid meta data header"))?;
            serde_json::from_str(raw)
                .map_err(|err| Error::validation(format!("invalid meta data header: {err}")))?
        }
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    Ok((columns, meta_data))
}

fn concrete_ancestors(ctx: &RequestContext) -> Result<Vec<(String, Uuid)>, Error> {
    ctx.resource()
        .ancestor_pk_columns()
        .into_iter()
        .map(|column| match ctx.path_ids.get(&column) {
            Some(Some(id)) => Ok((column, *id)),
            _ => Err(Error::validation(format!(
                "blob writes require a concrete {column}"
            ))),
        })
        .collect()
}

pub(super) async fn list(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::List)?;
    let params = ctx.list_params()?;
    let resource = ctx.resource();
    let table = collection::table_of(ctx);

    // The listing scope and pagination of collections, with the column
    // set widened by the blob extras.
    let columns = blob_columns(ctx);
    let stmt = query::select_list_with(&table, resource, &ctx.path_ids, &params, &columns)?;

    let mut conn = ctx.core().pool.acquire().await?;
    let rows = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_all(&mut *conn)
        .await?;

    let mut rows = rows;
    let mut headers = HeaderMap::new();
    if params.page.is_none() && rows.len() as i64 > params.limit {
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

    let objects = rows
        .iter()
        .map(|row| blob_object(ctx, row))
        .collect::<Result<Vec<_>, _>>()?;
    collection::record_audit(&mut conn, ctx, Operation::List, None).await?;

    let value =
        serde_json::Value::Array(objects.into_iter().map(serde_json::Value::Object).collect());
    json_response(&ctx.headers, headers, &value)
}

pub(super) async fn create(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Create)?;
    let payload = ctx.intercept(Operation::Create, ctx.body.to_vec()).await?;

    let resource = ctx.resource();
    let content_type = ctx
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let (columns, meta_data) = properties_from_headers(ctx)?;
    let ancestors = concrete_ancestors(ctx)?;
    let id = Uuid::new_v4();

    let core = ctx.core();
    let external = resource.external;
    if external && core.object_store.is_none() {
        return Err(Error::Storage(anyhow::anyhow!(
            "blob {} is declared external but no object store is configured",
            resource.path
        )));
    }

    let mut stmt = query::Statement::default();
    let mut names = vec![format!("\"{}\"", resource.pk_column())];
    let mut values = vec![stmt.bind(SqlArg::Uuid(id))];
    for (column, ancestor) in &ancestors {
        names.push(format!("\"{column}\""));
        values.push(stmt.bind(SqlArg::Uuid(*ancestor)));
    }
    names.push("\"timestamp\"".to_string());
    values.push(stmt.bind(SqlArg::Timestamp(query::truncate_millis(chrono::Utc::now()))));
    names.push("\"content_type\"".to_string());
    values.push(stmt.bind(SqlArg::Text(content_type)));
    names.push("\"meta_data\"".to_string());
    values.push(stmt.bind(SqlArg::Json(meta_data)));
    for (column, value) in &columns {
        names.push(format!("\"{column}\""));
        values.push(stmt.bind(SqlArg::NullableText(value.clone())));
    }
    if !external {
        names.push("\"data\"".to_string());
        values.push(stmt.bind(SqlArg::Bytes(payload.clone())));
    }
    stmt.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
        collection::table_of(ctx),
        names.join(", "),
        values.join(", "),
        selected_columns(ctx),
    );

    let mut txn = core.pool.begin().await?;
    let row = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_one(&mut *txn)
        .await
        .map_err(collection::map_write_error)?;
    let object = blob_object(ctx, &row)?;

    collection::record_audit(&mut txn, ctx, Operation::Create, Some(id)).await?;
    collection::notify(
        &mut txn,
        ctx,
        Operation::Create,
        id,
        serde_json::Value::Object(object.clone()),
    )
    .await?;
    txn.commit().await?;
    core.pipeline.trigger();

    if external {
        if let Some(store) = &core.object_store {
            store
                .put(&object_key(resource, id), &payload)
                .await
                .map_err(Error::Storage)?;
        }
    }

    Ok((StatusCode::OK, axum::Json(serde_json::Value::Object(object))).into_response())
}

pub(super) async fn read(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Read)?;
    let id = ctx.item_id()?;
    let resource = ctx.resource();
    let core = ctx.core();

    let mut stmt = query::Statement::default();
    let id_arg = stmt.bind(SqlArg::Uuid(id));
    stmt.sql = format!(
        "SELECT {}, \"data\" FROM {} WHERE \"{}\" = {id_arg}",
        selected_columns(ctx),
        collection::table_of(ctx),
        resource.pk_column(),
    );
    for column in resource.ancestor_pk_columns() {
        if let Some(Some(ancestor)) = ctx.path_ids.get(&column) {
            let arg = stmt.bind(SqlArg::Uuid(*ancestor));
            stmt.sql.push_str(&format!(" AND \"{column}\" = {arg}"));
        }
    }

    let mut conn = core.pool.acquire().await?;
    let Some(row) = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Err(Error::NotFound);
    };

    let object = blob_object(ctx, &row)?;
    let payload: Vec<u8> = if resource.external {
        let store = core
            .object_store
            .as_ref()
            .ok_or_else(|| Error::Storage(anyhow::anyhow!("no object store configured")))?;
        store
            .get(&object_key(resource, id))
            .await
            .map_err(Error::Storage)?
            .ok_or(Error::NotFound)?
    } else {
        row.try_get::<Option<Vec<u8>>, _>("data")
            .map_err(anyhow::Error::from)?
            .unwrap_or_default()
    };

    let payload = ctx.intercept(Operation::Read, payload).await?;
    collection::record_audit(&mut conn, ctx, Operation::Read, Some(id)).await?;

    let mut headers = HeaderMap::new();
    if let Some(content_type) = object.get("content_type").and_then(|v| v.as_str()) {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    for property in resource.property_columns() {
        if let Some(value) = object.get(property).and_then(|v| v.as_str()) {
            let name = HeaderName::from_bytes(canonical_header(property).as_bytes());
            if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
                headers.insert(name, value);
            }
        }
    }
    let meta = meta_header_value(resource, &object, id);
    if let Ok(value) = HeaderValue::from_str(&serde_json::Value::Object(meta).to_string()) {
        headers.insert(HeaderName::from_static("kurbisio-meta-data"), value);
    }

    // Mutable blobs version their ETag with the revision.
    let revision = object.get("revision").and_then(|v| v.as_i64()).unwrap_or(0);
    let tag = if resource.mutable {
        format!("\"{:x}-{revision}\"", md5::compute(&payload))
    } else {
        etag::compute(&payload)
    };
    headers.insert(
        ETAG,
        HeaderValue::from_str(&tag).map_err(|err| Error::Storage(anyhow::anyhow!(err)))?,
    );
    if etag::if_none_match(&ctx.headers, &tag) {
        return Ok(etag::not_modified(&headers, &tag));
    }
    Ok((StatusCode::OK, headers, payload).into_response())
}

/// Replace a mutable blob's payload, meta-data and properties.
pub(super) async fn put(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Update)?;
    let id = ctx.item_id()?;
    let payload = ctx.intercept(Operation::Update, ctx.body.to_vec()).await?;

    let resource = ctx.resource();
    let core = ctx.core();
    let content_type = ctx
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let (columns, meta_data) = properties_from_headers(ctx)?;

    let mut stmt = query::Statement::default();
    let mut sets = Vec::new();
    let arg = stmt.bind(SqlArg::Timestamp(query::truncate_millis(chrono::Utc::now())));
    sets.push(format!("\"timestamp\" = {arg}"));
    let arg = stmt.bind(SqlArg::Text(content_type));
    sets.push(format!("\"content_type\" = {arg}"));
    let arg = stmt.bind(SqlArg::Json(meta_data));
    sets.push(format!("\"meta_data\" = {arg}"));
    for (column, value) in &columns {
        let arg = stmt.bind(SqlArg::NullableText(value.clone()));
        sets.push(format!("\"{column}\" = {arg}"));
    }
    if !resource.external {
        let arg = stmt.bind(SqlArg::Bytes(payload.clone()));
        sets.push(format!("\"data\" = {arg}"));
    }
    sets.push("\"revision\" = \"revision\" + 1".to_string());

    let id_arg = stmt.bind(SqlArg::Uuid(id));
    stmt.sql = format!(
        "UPDATE {} SET {} WHERE \"{}\" = {id_arg}",
        collection::table_of(ctx),
        sets.join(", "),
        resource.pk_column(),
    );
    for column in resource.ancestor_pk_columns() {
        if let Some(Some(ancestor)) = ctx.path_ids.get(&column) {
            let arg = stmt.bind(SqlArg::Uuid(*ancestor));
            stmt.sql.push_str(&format!(" AND \"{column}\" = {arg}"));
        }
    }
    stmt.sql.push_str(&format!(" RETURNING {}", selected_columns(ctx)));

    let mut txn = core.pool.begin().await?;
    let Some(row) = query::bind_args(sqlx::query(&stmt.sql), &stmt.args)
        .fetch_optional(&mut *txn)
        .await
        .map_err(collection::map_write_error)?
    else {
        return Err(Error::NotFound);
    };
    let object = blob_object(ctx, &row)?;

    collection::record_audit(&mut txn, ctx, Operation::Update, Some(id)).await?;
    collection::notify(
        &mut txn,
        ctx,
        Operation::Update,
        id,
        serde_json::Value::Object(object),
    )
    .await?;
    txn.commit().await?;
    core.pipeline.trigger();

    if resource.external {
        if let Some(store) = &core.object_store {
            store
                .put(&object_key(resource, id), &payload)
                .await
                .map_err(Error::Storage)?;
        }
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

pub(super) async fn delete(ctx: &RequestContext) -> Result<Response, Error> {
    collection::delete(ctx).await
}

pub(super) async fn clear(ctx: &RequestContext) -> Result<Response, Error> {
    collection::clear(ctx).await
}
