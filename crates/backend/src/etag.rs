//! ETag computation and `If-None-Match` evaluation for GET responses.

use axum::http::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_LOCATION, DATE, ETAG, EXPIRES, IF_NONE_MATCH,
    VARY,
};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Stable hash of a response body, in quoted form.
pub fn compute(body: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(body))
}

/// Whether `If-None-Match` matches `etag`: a literal `*`, the exact tag,
/// or any quoted member of a comma-separated list.
pub fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    value
        .split(',')
        .map(str::trim)
        .any(|member| member == "*" || member == etag || member.trim_matches('"') == etag.trim_matches('"'))
}

/// Build a 304 response echoing the cache-relevant headers the 200
/// response would have carried.
pub fn not_modified(would_be: &HeaderMap, etag: &str) -> Response {
    let mut headers = HeaderMap::new();
    for name in [CACHE_CONTROL, CONTENT_LOCATION, DATE, EXPIRES, VARY] {
        if let Some(value) = would_be.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(ETAG, value);
    }
    (StatusCode::NOT_MODIFIED, headers).into_response()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn etag_is_stable_and_quoted() {
        let a = compute(b"{\"a\":1}");
        let b = compute(b"{\"a\":1}");
        assert_eq!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_ne!(a, compute(b"{\"a\":2}"));
    }

    #[test]
    fn if_none_match_variants() {
        let etag = compute(b"body");
        let mut headers = HeaderMap::new();

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(if_none_match(&headers, &etag));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_str(&etag).unwrap());
        assert!(if_none_match(&headers, &etag));

        let list = format!("\"zzz\", {etag}, \"yyy\"");
        headers.insert(IF_NONE_MATCH, HeaderValue::from_str(&list).unwrap());
        assert!(if_none_match(&headers, &etag));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"zzz\""));
        assert!(!if_none_match(&headers, &etag));
    }
}
