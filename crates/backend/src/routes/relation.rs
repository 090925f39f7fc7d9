//! Relation routes: a declared relation exposes each side as a virtual
//! child of the other, backed by the symmetric link table. The permits of
//! the side being read or linked apply.

use crate::access;
use crate::error::Error;
use crate::query;
use crate::schema;
use crate::Core;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodFilter;
use axum::Extension;
use models::{plural, Authorization, Operation, Resource};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
struct RelationTarget {
    core: Arc<Core>,
    /// The resource whose id is in the path.
    from: Arc<Resource>,
    /// The resource being listed, linked or unlinked.
    to: Arc<Resource>,
    link_table: String,
}

#[derive(Clone, Copy)]
enum RelationAction {
    List,
    Link,
    Unlink,
}

pub(super) fn register(
    table: &mut BTreeMap<String, axum::routing::MethodRouter>,
    core: &Arc<Core>,
) {
    for relation in core.catalog.relations() {
        let left = Arc::new(core.catalog.resource(&relation.left).expect("validated").clone());
        let right = Arc::new(core.catalog.resource(&relation.right).expect("validated").clone());
        let link_table = schema::quoted(&core.schema, &relation.table());

        for (from, to) in [(left.clone(), right.clone()), (right, left)] {
            let target = RelationTarget {
                core: core.clone(),
                from: from.clone(),
                to: to.clone(),
                link_table: link_table.clone(),
            };
            let base = format!(
                "/{}/:{}/{}",
                plural(from.this()),
                from.pk_column(),
                plural(to.this())
            );
            let item = format!("{base}/:{}", to.pk_column());

            add(table, base, MethodFilter::GET, target.clone(), RelationAction::List);
            add(table, item.clone(), MethodFilter::PUT, target.clone(), RelationAction::Link);
            add(table, item, MethodFilter::DELETE, target, RelationAction::Unlink);
        }
    }
}

fn add(
    table: &mut BTreeMap<String, axum::routing::MethodRouter>,
    path: String,
    filter: MethodFilter,
    target: RelationTarget,
    action: RelationAction,
) {
    let method_router = table.remove(&path).unwrap_or_default();
    let handler = move |Path(params): Path<HashMap<String, String>>,
                        auth: Option<Extension<Authorization>>| {
        dispatch(target.clone(), action, params, auth)
    };
    table.insert(path, method_router.on(filter, handler));
}

async fn dispatch(
    target: RelationTarget,
    action: RelationAction,
    params: HashMap<String, String>,
    auth: Option<Extension<Authorization>>,
) -> Response {
    let auth = auth.map(|Extension(auth)| auth).unwrap_or_default();
    let result = match action {
        RelationAction::List => list(&target, &params, &auth).await,
        RelationAction::Link => link(&target, &params, &auth, true).await,
        RelationAction::Unlink => link(&target, &params, &auth, false).await,
    };
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn segment_id(params: &HashMap<String, String>, column: &str) -> Result<Uuid, Error> {
    let raw = params
        .get(column)
        .ok_or_else(|| Error::validation(format!("missing path segment {column:?}")))?;
    raw.parse()
        .map_err(|_| Error::validation(format!("invalid {column} {raw:?}")))
}

fn authorize(
    target: &RelationTarget,
    auth: &Authorization,
    operation: Operation,
    path_ids: &access::PathIds,
) -> Result<(), Error> {
    if access::authorized(&target.to.permits, auth, operation, path_ids) {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

async fn list(
    target: &RelationTarget,
    params: &HashMap<String, String>,
    auth: &Authorization,
) -> Result<Response, Error> {
    let from_id = segment_id(params, &target.from.pk_column())?;
    let mut path_ids = access::PathIds::new();
    path_ids.insert(target.from.pk_column(), Some(from_id));
    authorize(target, auth, Operation::List, &path_ids)?;

    let columns = query::select_columns(&target.to, false)
        .iter()
        .map(|c| format!("r.\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {columns} FROM {to_table} r JOIN {link} l ON r.\"{to_pk}\" = l.\"{to_pk}\" WHERE l.\"{from_pk}\" = $1 ORDER BY r.\"timestamp\" DESC, r.\"{to_pk}\" DESC",
        to_table = schema::quoted(&target.core.schema, target.to.table()),
        link = target.link_table,
        to_pk = target.to.pk_column(),
        from_pk = target.from.pk_column(),
    );
    let rows = sqlx::query(&sql)
        .bind(from_id)
        .fetch_all(&target.core.pool)
        .await?;

    let objects = rows
        .iter()
        .map(|row| query::row_to_object(&target.to, row, false))
        .collect::<Result<Vec<_>, _>>()?;
    let value =
        serde_json::Value::Array(objects.into_iter().map(serde_json::Value::Object).collect());
    super::json_response(&HeaderMap::new(), HeaderMap::new(), &value)
}

async fn link(
    target: &RelationTarget,
    params: &HashMap<String, String>,
    auth: &Authorization,
    create: bool,
) -> Result<Response, Error> {
    let from_id = segment_id(params, &target.from.pk_column())?;
    let to_id = segment_id(params, &target.to.pk_column())?;
    let mut path_ids = access::PathIds::new();
    path_ids.insert(target.from.pk_column(), Some(from_id));
    path_ids.insert(target.to.pk_column(), Some(to_id));
    authorize(target, auth, Operation::Update, &path_ids)?;

    let mut txn = target.core.pool.begin().await?;

    // Both endpoints must exist.
    for (resource, id) in [(&target.from, from_id), (&target.to, to_id)] {
        let sql = format!(
            "SELECT 1 FROM {} WHERE \"{}\" = $1",
            schema::quoted(&target.core.schema, resource.table()),
            resource.pk_column()
        );
        if sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *txn)
            .await?
            .is_none()
        {
            return Err(Error::NotFound);
        }
    }

    if create {
        let sql = format!(
            "INSERT INTO {} (\"{}\", \"{}\") VALUES ($1, $2) ON CONFLICT DO NOTHING",
            target.link_table,
            target.from.pk_column(),
            target.to.pk_column(),
        );
        sqlx::query(&sql)
            .bind(from_id)
            .bind(to_id)
            .execute(&mut *txn)
            .await?;
    } else {
        let sql = format!(
            "DELETE FROM {} WHERE \"{}\" = $1 AND \"{}\" = $2",
            target.link_table,
            target.from.pk_column(),
            target.to.pk_column(),
        );
        sqlx::query(&sql)
            .bind(from_id)
            .bind(to_id)
            .execute(&mut *txn)
            .await?;
    }
    txn.commit().await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}
