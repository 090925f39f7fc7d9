//! In-band request/response interception. At most one interceptor per
//! (resource, operation) pair, registered at build time.

use crate::error::Error;
use models::Operation;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// The request as an interceptor sees it.
#[derive(Debug)]
pub struct InterceptRequest<'r> {
    pub resource: &'r str,
    pub resource_id: Option<Uuid>,
    pub operation: Operation,
    /// The caller's authorization selectors.
    pub selectors: &'r BTreeMap<String, String>,
    /// Query parameters of the request.
    pub parameters: &'r BTreeMap<String, String>,
}

/// An interceptor may rewrite the payload (`Some(replacement)`), pass it
/// through unchanged (`None`), or abort the request with an error.
///
/// For create and update the payload is the request body and a returned
/// replacement is persisted; for read and list it is the response body
/// and a replacement is returned to the caller. A read interceptor may
/// receive zero-length data for a singleton that does not yet exist and
/// synthesize one.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        request: InterceptRequest<'_>,
        data: Vec<u8>,
    ) -> anyhow::Result<Option<Vec<u8>>>;
}

#[derive(Default, Clone)]
pub(crate) struct Registry {
    handlers: BTreeMap<(String, Operation), Arc<dyn Interceptor>>,
}

impl Registry {
    /// Register `interceptor`; a second registration for the same pair is
    /// fatal.
    pub fn insert(&mut self, resource: &str, operation: Operation, interceptor: Arc<dyn Interceptor>) {
        if self
            .handlers
            .insert((resource.to_string(), operation), interceptor)
            .is_some()
        {
            panic!("an interceptor for {resource:?} {operation} is already registered");
        }
    }

    pub fn get(&self, resource: &str, operation: Operation) -> Option<&Arc<dyn Interceptor>> {
        self.handlers.get(&(resource.to_string(), operation))
    }

    /// Run the interceptor for the pair, if any, mapping its error to the
    /// operation's HTTP status. Returns the (possibly replaced) payload.
    pub async fn run(
        &self,
        request: InterceptRequest<'_>,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let operation = request.operation;
        let Some(interceptor) = self.get(request.resource, operation) else {
            return Ok(data);
        };
        match interceptor.intercept(request, data.clone()).await {
            Ok(Some(replacement)) => Ok(replacement),
            Ok(None) => Ok(data),
            Err(err) => Err(Error::Interceptor {
                message: format!("{err:#}"),
                read: matches!(operation, Operation::Read | Operation::List),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Uppercase;
    #[async_trait::async_trait]
    impl Interceptor for Uppercase {
        async fn intercept(
            &self,
            _request: InterceptRequest<'_>,
            data: Vec<u8>,
        ) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(Some(data.to_ascii_uppercase()))
        }
    }

    struct Reject;
    #[async_trait::async_trait]
    impl Interceptor for Reject {
        async fn intercept(
            &self,
            _request: InterceptRequest<'_>,
            _data: Vec<u8>,
        ) -> anyhow::Result<Option<Vec<u8>>> {
            anyhow::bail!("not on my watch")
        }
    }

    fn request(operation: Operation) -> InterceptRequest<'static> {
        static EMPTY: std::sync::OnceLock<BTreeMap<String, String>> = std::sync::OnceLock::new();
        let empty = EMPTY.get_or_init(BTreeMap::new);
        InterceptRequest {
            resource: "fleet",
            resource_id: None,
            operation,
            selectors: empty,
            parameters: empty,
        }
    }

    #[tokio::test]
    async fn replacement_is_returned() {
        let mut registry = Registry::default();
        registry.insert("fleet", Operation::Create, Arc::new(Uppercase));

        let out = registry
            .run(request(Operation::Create), b"abc".to_vec())
            .await
            .unwrap();
        assert_eq!(out, b"ABC");

        // No interceptor for updates: data passes through.
        let out = registry
            .run(request(Operation::Update), b"abc".to_vec())
            .await
            .unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn errors_map_by_operation() {
        let mut registry = Registry::default();
        registry.insert("fleet", Operation::Create, Arc::new(Reject));
        registry.insert("fleet", Operation::Read, Arc::new(Reject));

        let err = registry
            .run(request(Operation::Create), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "not on my watch");

        let err = registry
            .run(request(Operation::Read), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_is_fatal() {
        let mut registry = Registry::default();
        registry.insert("fleet", Operation::Create, Arc::new(Uppercase));
        registry.insert("fleet", Operation::Create, Arc::new(Uppercase));
    }
}
