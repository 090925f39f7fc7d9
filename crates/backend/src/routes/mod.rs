//! Route generator: expands the resource catalog into the REST surface
//! and funnels every request through the fixed pipeline of
//! authorization, interception, SQL and notification enqueue.

use crate::access::{self, PathIds};
use crate::error::Error;
use crate::etag;
use crate::intercept::InterceptRequest;
use crate::Core;
use axum::body::Bytes;
use axum::extract::{Path, RawQuery};
use axum::http::header::{CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodFilter;
use axum::Extension;
use models::{plural, Authorization, Kind, Operation, Resource, ROLE_ADMIN};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

mod blob;
mod collection;
mod meta;
mod relation;
mod singleton;

/// Where a path segment's id comes from at request time.
#[derive(Debug, Clone)]
pub(crate) enum SegmentSource {
    /// A `{param}` in the route pattern. The literal id `all` is a
    /// wildcard.
    PathParam(String),
    /// Hidden behind a shortcut: taken from the caller's authorization
    /// selectors.
    Selector(String),
    /// Unconstrained (ancestors above a shortcut target).
    Any,
    /// Singletons reuse their parent's id.
    SameAsParent,
}

/// One generated route's target: the resource plus the id sources of its
/// path segments.
#[derive(Clone)]
pub(crate) struct RouteTarget {
    pub core: Arc<Core>,
    pub resource: Arc<Resource>,
    /// Ancestor pk columns with their id sources, outermost first.
    pub ancestors: Arc<Vec<(String, SegmentSource)>>,
    /// Item id source, for item-level routes.
    pub item: Option<SegmentSource>,
    /// Roles admitted to a shortcut route; `None` for canonical routes.
    pub shortcut_roles: Option<Arc<Vec<String>>>,
}

#[derive(Clone)]
pub(crate) enum Action {
    List,
    Create,
    Upsert,
    BulkPatch,
    Clear,
    Read,
    Put,
    Patch,
    Delete,
    FastPut(String),
    BlobList,
    BlobCreate,
    BlobRead,
    BlobPut,
    BlobDelete,
    BlobClear,
}

/// Build the complete router for the catalog.
pub(crate) fn build_router(core: &Arc<Core>) -> axum::Router {
    let mut table: BTreeMap<String, axum::routing::MethodRouter> = BTreeMap::new();

    for resource in core.catalog.resources() {
        let resource = Arc::new(resource.clone());
        for prefix in prefixes_of(core, &resource) {
            register_resource_routes(&mut table, core, &resource, prefix);
        }
    }

    relation::register(&mut table, core);

    let mut router = axum::Router::new();
    for (path, method_router) in table {
        router = router.route(&path, method_router);
    }
    meta::register(router, core)
}

/// One route prefix addressing `resource`, ending at the resource's
/// parent; the resource's own segment is appended during registration.
struct RoutePrefix {
    prefix: String,
    ancestors: Arc<Vec<(String, SegmentSource)>>,
    shortcut_roles: Option<Arc<Vec<String>>>,
    /// A shortcut targeting the resource itself hides the
    /// `/{plural}/{id}` pair: item routes live directly at the prefix.
    hides_item: bool,
}

/// All route prefixes addressing `resource`: the canonical one plus one
/// per shortcut that targets the resource or one of its ancestors.
fn prefixes_of(core: &Arc<Core>, resource: &Arc<Resource>) -> Vec<RoutePrefix> {
    let mut out = Vec::new();

    // Canonical prefix: /as/{a_id}/bs/{b_id}/...
    let mut prefix = String::new();
    let mut ancestors = Vec::new();
    for segment in resource.ancestors() {
        let column = format!("{segment}_id");
        prefix.push_str(&format!("/{}/:{column}", plural(segment)));
        ancestors.push((column.clone(), SegmentSource::PathParam(column)));
    }
    out.push(RoutePrefix {
        prefix,
        ancestors: Arc::new(ancestors),
        shortcut_roles: None,
        hides_item: false,
    });

    // Shortcut prefixes: /{shortcut} stands in for the target's
    // `/{plural}/{id}` pair; ancestors above the target are
    // unconstrained, segments below keep their path parameters.
    for shortcut in core.catalog.shortcuts() {
        let Some(target) = core.catalog.resource(&shortcut.target) else {
            continue;
        };
        let on_self = resource.path == target.path;
        let applies = on_self || resource.path.starts_with(&format!("{}/", target.path));
        if !applies {
            continue;
        }

        let mut prefix = format!("/{}", shortcut.shortcut);
        let mut ancestors: Vec<(String, SegmentSource)> = target
            .ancestors()
            .iter()
            .map(|segment| (format!("{segment}_id"), SegmentSource::Any))
            .collect();

        if !on_self {
            ancestors.push((
                target.pk_column(),
                SegmentSource::Selector(target.pk_column()),
            ));
            let below = &resource.ancestors()[target.segments.len()..];
            for segment in below {
                let column = format!("{segment}_id");
                prefix.push_str(&format!("/{}/:{column}", plural(segment)));
                ancestors.push((column.clone(), SegmentSource::PathParam(column)));
            }
        }
        out.push(RoutePrefix {
            prefix,
            ancestors: Arc::new(ancestors),
            shortcut_roles: Some(Arc::new(shortcut.roles.clone())),
            hides_item: on_self,
        });
    }

    out
}

fn register_resource_routes(
    table: &mut BTreeMap<String, axum::routing::MethodRouter>,
    core: &Arc<Core>,
    resource: &Arc<Resource>,
    route_prefix: RoutePrefix,
) {
    let this = resource.this();
    let pk = resource.pk_column();
    let RoutePrefix {
        prefix,
        ancestors,
        shortcut_roles,
        hides_item,
    } = route_prefix;

    let target = |item: Option<SegmentSource>| RouteTarget {
        core: core.clone(),
        resource: resource.clone(),
        ancestors: ancestors.clone(),
        item,
        shortcut_roles: shortcut_roles.clone(),
    };

    let mut add = |path: String, filter: MethodFilter, t: RouteTarget, action: Action| {
        let method_router = table.remove(&path).unwrap_or_default();
        let handler = move |Path(params): Path<HashMap<String, String>>,
                            RawQuery(query): RawQuery,
                            headers: HeaderMap,
                            auth: Option<Extension<Authorization>>,
                            body: Bytes| {
            dispatch(t.clone(), action.clone(), params, query, headers, auth, body)
        };
        table.insert(path, method_router.on(filter, handler));
    };

    if hides_item {
        // /{shortcut} item routes; the id arrives via selectors.
        let item = Some(SegmentSource::Selector(pk.clone()));
        let base = prefix.clone();
        match resource.kind {
            Kind::Blob => {
                add(base.clone(), MethodFilter::GET, target(item.clone()), Action::BlobRead);
                if resource.mutable {
                    add(base.clone(), MethodFilter::PUT, target(item.clone()), Action::BlobPut);
                }
                add(base, MethodFilter::DELETE, target(item), Action::BlobDelete);
            }
            _ => {
                add(base.clone(), MethodFilter::GET, target(item.clone()), Action::Read);
                add(base.clone(), MethodFilter::PUT, target(item.clone()), Action::Put);
                add(base.clone(), MethodFilter::PATCH, target(item.clone()), Action::Patch);
                add(base.clone(), MethodFilter::DELETE, target(item.clone()), Action::Delete);
                for property in &resource.static_properties {
                    add(
                        format!("{base}/{property}/:value"),
                        MethodFilter::PUT,
                        target(item.clone()),
                        Action::FastPut(property.clone()),
                    );
                }
            }
        }
        return;
    }

    let collection_path = format!("{prefix}/{}", plural(this));
    let item_path = format!("{collection_path}/:{pk}");
    let item = Some(SegmentSource::PathParam(pk.clone()));

    match resource.kind {
        Kind::Collection => {
            add(collection_path.clone(), MethodFilter::GET, target(None), Action::List);
            add(collection_path.clone(), MethodFilter::POST, target(None), Action::Create);
            add(collection_path.clone(), MethodFilter::PUT, target(None), Action::Upsert);
            add(collection_path.clone(), MethodFilter::PATCH, target(None), Action::BulkPatch);
            add(collection_path, MethodFilter::DELETE, target(None), Action::Clear);

            add(item_path.clone(), MethodFilter::GET, target(item.clone()), Action::Read);
            add(item_path.clone(), MethodFilter::PUT, target(item.clone()), Action::Put);
            add(item_path.clone(), MethodFilter::PATCH, target(item.clone()), Action::Patch);
            add(item_path.clone(), MethodFilter::DELETE, target(item.clone()), Action::Delete);

            for property in &resource.static_properties {
                add(
                    format!("{item_path}/{property}/:value"),
                    MethodFilter::PUT,
                    target(item.clone()),
                    Action::FastPut(property.clone()),
                );
            }
        }
        Kind::Singleton => {
            // Singular alias: the item is addressed through its parent.
            let singular_path = format!("{prefix}/{this}");
            let singular = Some(SegmentSource::SameAsParent);
            add(singular_path.clone(), MethodFilter::GET, target(singular.clone()), Action::Read);
            add(singular_path.clone(), MethodFilter::PUT, target(singular.clone()), Action::Put);
            add(singular_path.clone(), MethodFilter::PATCH, target(singular.clone()), Action::Patch);
            add(singular_path.clone(), MethodFilter::DELETE, target(singular.clone()), Action::Delete);
            for property in &resource.static_properties {
                add(
                    format!("{singular_path}/{property}/:value"),
                    MethodFilter::PUT,
                    target(singular.clone()),
                    Action::FastPut(property.clone()),
                );
            }

            // Collection form.
            add(collection_path.clone(), MethodFilter::GET, target(None), Action::List);
            add(collection_path, MethodFilter::PUT, target(None), Action::Upsert);
            add(item_path.clone(), MethodFilter::GET, target(item.clone()), Action::Read);
            add(item_path.clone(), MethodFilter::PUT, target(item.clone()), Action::Put);
            add(item_path.clone(), MethodFilter::PATCH, target(item.clone()), Action::Patch);
            add(item_path, MethodFilter::DELETE, target(item), Action::Delete);
        }
        Kind::Blob => {
            add(collection_path.clone(), MethodFilter::GET, target(None), Action::BlobList);
            add(collection_path.clone(), MethodFilter::POST, target(None), Action::BlobCreate);
            add(collection_path, MethodFilter::DELETE, target(None), Action::BlobClear);

            add(item_path.clone(), MethodFilter::GET, target(item.clone()), Action::BlobRead);
            if resource.mutable {
                add(item_path.clone(), MethodFilter::PUT, target(item.clone()), Action::BlobPut);
            }
            add(item_path, MethodFilter::DELETE, target(item), Action::BlobDelete);
        }
    }
}

/// A request resolved against its route target: caller identity, concrete
/// path ids, query and body.
pub(crate) struct RequestContext {
    pub target: RouteTarget,
    pub auth: Authorization,
    /// Ancestor ids plus, for item routes, the item id under the pk
    /// column. `None` values are the wildcard `all`.
    pub path_ids: PathIds,
    pub item_id: Option<Uuid>,
    pub path_params: HashMap<String, String>,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: Uuid,
}

async fn dispatch(
    target: RouteTarget,
    action: Action,
    params: HashMap<String, String>,
    query: Option<String>,
    headers: HeaderMap,
    auth: Option<Extension<Authorization>>,
    body: Bytes,
) -> Response {
    let auth = auth.map(|Extension(auth)| auth).unwrap_or_default();
    let ctx = match RequestContext::resolve(target, params, query, headers, auth, body) {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let result = match action {
        Action::List => collection::list(&ctx).await,
        Action::Create => collection::create(&ctx).await,
        Action::Upsert => collection::upsert(&ctx).await,
        Action::BulkPatch => collection::bulk_patch(&ctx).await,
        Action::Clear => collection::clear(&ctx).await,
        Action::Read => {
            if ctx.target.resource.kind == Kind::Singleton {
                singleton::read(&ctx).await
            } else {
                collection::read(&ctx).await
            }
        }
        Action::Put => collection::put(&ctx).await,
        Action::Patch => collection::patch(&ctx).await,
        Action::Delete => collection::delete(&ctx).await,
        Action::FastPut(property) => collection::fast_put(&ctx, &property).await,
        Action::BlobList => blob::list(&ctx).await,
        Action::BlobCreate => blob::create(&ctx).await,
        Action::BlobRead => blob::read(&ctx).await,
        Action::BlobPut => blob::put(&ctx).await,
        Action::BlobDelete => blob::delete(&ctx).await,
        Action::BlobClear => blob::clear(&ctx).await,
    };

    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

impl RequestContext {
    fn resolve(
        target: RouteTarget,
        path_params: HashMap<String, String>,
        query: Option<String>,
        headers: HeaderMap,
        auth: Authorization,
        body: Bytes,
    ) -> Result<Self, Error> {
        // Shortcut routes admit only their configured roles.
        if let Some(roles) = &target.shortcut_roles {
            let admitted = auth.has_role(ROLE_ADMIN)
                || roles.is_empty()
                || roles.iter().any(|role| auth.has_role(role));
            if !admitted {
                return Err(Error::Unauthorized);
            }
        }

        let mut path_ids = PathIds::new();
        for (column, source) in target.ancestors.iter() {
            let id = resolve_segment(source, column, &path_params, &auth)?;
            path_ids.insert(column.clone(), id);
        }

        let item_id = match &target.item {
            None => None,
            Some(SegmentSource::SameAsParent) => {
                let parent = target
                    .ancestors
                    .last()
                    .and_then(|(column, _)| path_ids.get(column))
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
            }
            Some(source) => {
                let pk = target.resource.pk_column();
                match resolve_segment(source, &pk, &path_params, &auth)? {
                    Some(id) => Some(id),
                    None => {
                        return Err(Error::validation(
                            "the wildcard id is not valid for item operations",
                        ))
                    }
                }
            }
        };
        if let Some(id) = item_id {
            path_ids.insert(target.resource.pk_column(), Some(id));
        }

        Ok(Self {
            target,
            auth,
            path_ids,
            item_id,
            path_params,
            query,
            headers,
            body,
            request_id: Uuid::new_v4(),
        })
    }

    pub fn core(&self) -> &Core {
        &self.target.core
    }

    pub fn resource(&self) -> &Resource {
        &self.target.resource
    }

    /// The item id of an item-level route.
    pub fn item_id(&self) -> Result<Uuid, Error> {
        self.item_id.ok_or(Error::NotFound)
    }

    pub fn authorize(&self, operation: Operation) -> Result<(), Error> {
        access::authorize(self.resource(), &self.auth, operation, &self.path_ids)
    }

    pub fn list_params(&self) -> Result<crate::query::ListParams, Error> {
        crate::query::ListParams::parse(self.query.as_deref())
    }

    pub fn job_context(&self) -> jobs::JobContext {
        jobs::JobContext {
            request_id: Some(self.request_id),
        }
    }

    /// Raw query parameters, as interceptors see them.
    pub fn raw_params(&self) -> BTreeMap<String, String> {
        let Some(query) = self.query.as_deref() else {
            return BTreeMap::new();
        };
        url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Run the interceptor for `operation`, if any.
    pub async fn intercept(
        &self,
        operation: Operation,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let parameters = self.raw_params();
        let request = InterceptRequest {
            resource: &self.resource().path,
            resource_id: self.item_id,
            operation,
            selectors: &self.auth.selectors,
            parameters: &parameters,
        };
        self.core().interceptors.run(request, data).await
    }

    /// Parse the request body as a JSON object.
    pub fn json_object(
        body: &[u8],
    ) -> Result<serde_json::Map<String, serde_json::Value>, Error> {
        match serde_json::from_slice(body) {
            Ok(serde_json::Value::Object(object)) => Ok(object),
            Ok(_) => Err(Error::validation("request body must be a JSON object")),
            Err(err) => Err(Error::validation(format!("invalid JSON body: {err}"))),
        }
    }
}

fn resolve_segment(
    source: &SegmentSource,
    column: &str,
    path_params: &HashMap<String, String>,
    auth: &Authorization,
) -> Result<Option<Uuid>, Error> {
    match source {
        SegmentSource::Any => Ok(None),
        SegmentSource::PathParam(name) => {
            let raw = path_params
                .get(name)
                .ok_or_else(|| Error::validation(format!("missing path segment {name:?}")))?;
            if raw == "all" {
                return Ok(None);
            }
            raw.parse()
                .map(Some)
                .map_err(|_| Error::validation(format!("invalid {column} {raw:?}")))
        }
        // The hidden id of a shortcut: the caller's authorization must
        // supply it.
        SegmentSource::Selector(selector) => match auth.selector(selector) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Error::validation(format!("invalid {column} selector"))),
            None => Err(Error::Unauthorized),
        },
        SegmentSource::SameAsParent => unreachable!("resolved by the caller"),
    }
}

/// Serialize `value` and respond with an ETag, honoring `If-None-Match`.
pub(crate) fn json_response(
    request_headers: &HeaderMap,
    mut headers: HeaderMap,
    value: &serde_json::Value,
) -> Result<Response, Error> {
    let body = serde_json::to_vec(value)
        .map_err(|err| Error::Storage(anyhow::anyhow!("response encoding failed: {err}")))?;
    let tag = etag::compute(&body);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        ETAG,
        HeaderValue::from_str(&tag).map_err(|err| Error::Storage(anyhow::anyhow!(err)))?,
    );
    if etag::if_none_match(request_headers, &tag) {
        return Ok(etag::not_modified(&headers, &tag));
    }
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Respond with raw (possibly interceptor-synthesized) JSON bytes.
pub(crate) fn raw_json_response(
    request_headers: &HeaderMap,
    mut headers: HeaderMap,
    body: Vec<u8>,
) -> Result<Response, Error> {
    let tag = etag::compute(&body);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        ETAG,
        HeaderValue::from_str(&tag).map_err(|err| Error::Storage(anyhow::anyhow!(err)))?,
    );
    if etag::if_none_match(request_headers, &tag) {
        return Ok(etag::not_modified(&headers, &tag));
    }
    Ok((StatusCode::OK, headers, body).into_response())
}
