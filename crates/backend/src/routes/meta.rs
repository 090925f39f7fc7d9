//! Administrative endpoints: raising events, per-resource statistics,
//! pipeline health and the version route.

use crate::error::Error;
use crate::schema;
use crate::Core;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Extension;
use models::{Authorization, Kind, ROLE_ADMIN, ROLE_ADMIN_VIEWER};
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

pub(super) fn register(router: axum::Router, core: &Arc<Core>) -> axum::Router {
    let events_core = core.clone();
    let statistics_core = core.clone();
    let health_core = core.clone();
    let version = core.version.clone();

    router
        .route(
            "/kurbisio/events/:event_type",
            put(
                move |Path(event_type): Path<String>,
                      auth: Option<Extension<Authorization>>,
                      body: axum::body::Bytes| {
                    let core = events_core.clone();
                    async move {
                        raise_event(core, event_type, caller(auth), body)
                            .await
                            .unwrap_or_else(|err| err.into_response())
                    }
                },
            ),
        )
        .route(
            "/kurbisio/statistics",
            get(
                move |query: axum::extract::RawQuery,
                      headers: HeaderMap,
                      auth: Option<Extension<Authorization>>| {
                    let core = statistics_core.clone();
                    async move {
                        statistics(core, query.0, headers, caller(auth))
                            .await
                            .unwrap_or_else(|err| err.into_response())
                    }
                },
            ),
        )
        .route(
            "/kurbisio/health",
            get(move |auth: Option<Extension<Authorization>>| {
                let core = health_core.clone();
                async move {
                    health(core, caller(auth))
                        .await
                        .unwrap_or_else(|err| err.into_response())
                }
            }),
        )
        .route(
            "/version",
            get(move || {
                let version = version.clone();
                async move { axum::Json(serde_json::json!({"version": version})) }
            }),
        )
}

fn caller(auth: Option<Extension<Authorization>>) -> Authorization {
    auth.map(|Extension(auth)| auth).unwrap_or_default()
}

/// Raise an application event. Admins and admin viewers only; raising a
/// type with no registered handler is a conflict.
async fn raise_event(
    core: Arc<Core>,
    event_type: String,
    auth: Authorization,
    body: axum::body::Bytes,
) -> Result<Response, Error> {
    if !auth.has_role(ROLE_ADMIN) && !auth.has_role(ROLE_ADMIN_VIEWER) {
        return Err(Error::Unauthorized);
    }
    if !core.pipeline.has_event_handler(&event_type) {
        return Err(Error::NoEventHandler(event_type));
    }

    let payload = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| Error::validation(format!("invalid JSON payload: {err}")))?
    };

    let event = jobs::Event::new(&event_type).with_payload(payload);
    let context = jobs::JobContext {
        request_id: Some(Uuid::new_v4()),
    };
    core.pipeline.raise_event(&event, &context).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(serde::Serialize)]
struct ResourceStatistics {
    resource: String,
    count: i64,
    size_mb: f64,
    average_size_b: i64,
}

/// Per-resource row counts and on-disk sizes, grouped by resource kind.
async fn statistics(
    core: Arc<Core>,
    query: Option<String>,
    headers: HeaderMap,
    auth: Authorization,
) -> Result<Response, Error> {
    if !auth.has_role(ROLE_ADMIN) {
        return Err(Error::Unauthorized);
    }

    let selected: Option<Vec<String>> = query.as_deref().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| key == "resource")
            .map(|(_, value)| value.split(',').map(str::to_string).collect())
    });

    let mut collections = Vec::new();
    let mut singletons = Vec::new();
    let mut blobs = Vec::new();

    for resource in core.catalog.resources() {
        if let Some(selected) = &selected {
            if !selected.iter().any(|s| *s == resource.path) {
                continue;
            }
        }
        let table = schema::quoted(&core.schema, resource.table());
        let count: i64 = sqlx::query(&format!("SELECT count(*) AS \"count\" FROM {table}"))
            .fetch_one(&core.pool)
            .await?
            .try_get("count")
            .map_err(anyhow::Error::from)?;
        let size: i64 = sqlx::query("SELECT pg_total_relation_size($1::regclass) AS \"size\"")
            .bind(format!("\"{}\".\"{}\"", core.schema, resource.table()))
            .fetch_one(&core.pool)
            .await?
            .try_get("size")
            .map_err(anyhow::Error::from)?;

        let entry = ResourceStatistics {
            resource: resource.path.clone(),
            count,
            size_mb: (size as f64) / 1_000_000.0,
            average_size_b: if count > 0 { size / count } else { 0 },
        };
        match resource.kind {
            Kind::Collection => collections.push(entry),
            Kind::Singleton => singletons.push(entry),
            Kind::Blob => blobs.push(entry),
        }
    }

    let value = serde_json::json!({
        "collections": collections,
        "singletons": singletons,
        "blobs": blobs,
    });
    super::json_response(&headers, HeaderMap::new(), &value)
}

/// Failed jobs, retained in the queue with `attempts_left = 0`.
async fn health(core: Arc<Core>, auth: Authorization) -> Result<Response, Error> {
    if !auth.has_role(ROLE_ADMIN) {
        return Err(Error::Unauthorized);
    }
    let failed = core.pipeline.failed_jobs().await?;
    Ok(axum::Json(serde_json::json!({"failed_jobs": failed})).into_response())
}
