//! Singleton-specific handling. Singletons share the collection write
//! path (their singular alias resolves the item id from the parent and
//! the pk is pinned there); reads differ in one way: a read interceptor
//! may synthesize a singleton that does not exist yet.

use super::{collection, raw_json_response, RequestContext};
use crate::error::Error;
use crate::query;
use axum::http::HeaderMap;
use axum::response::Response;
use models::Operation;

pub(super) async fn read(ctx: &RequestContext) -> Result<Response, Error> {
    ctx.authorize(Operation::Read)?;
    let params = ctx.list_params()?;
    let id = ctx.item_id()?;

    let mut conn = ctx.core().pool.acquire().await?;
    let row = collection::fetch_item(&mut conn, ctx, id, false).await?;

    let body = match row {
        Some(row) => {
            let mut object = query::row_to_object(ctx.resource(), &row, false)?;
            if !params.children.is_empty() {
                let mut objects = vec![object];
                collection::attach_children(&mut conn, ctx, &params.children, &mut objects)
                    .await?;
                object = objects.pop().expect("one object in, one out");
            }
            collection::record_audit(&mut conn, ctx, Operation::Read, Some(id)).await?;
            serde_json::to_vec(&serde_json::Value::Object(object))
                .map_err(|err| Error::Storage(anyhow::anyhow!("response encoding failed: {err}")))?
        }
        // Not materialized yet: the interceptor sees zero-length data
        // and may synthesize a response.
        None => Vec::new(),
    };

    let body = if params.no_intercept {
        body
    } else {
        ctx.intercept(Operation::Read, body).await?
    };
    if body.is_empty() {
        return Err(Error::NotFound);
    }
    raw_json_response(&ctx.headers, HeaderMap::new(), body)
}
