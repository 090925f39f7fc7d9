//! Configuration-driven REST backend over a Postgres store.
//!
//! A single JSON configuration declares resources (collections,
//! singletons, blobs, relations, shortcuts); [`Builder`] compiles it into
//! a resource catalog, derives the SQL schema, and generates the full
//! REST surface as an axum router. Mutations enqueue notifications into
//! the durable job pipeline within the same transaction; events flow
//! through the same queue with compression, retries and rate limits.
//!
//! ```no_run
//! # async fn example(pool: sqlx::PgPool) -> Result<(), backend::Error> {
//! let config = models::BackendConfiguration::from_json(
//!     r#"{"collections": [{"resource": "fleet"}, {"resource": "fleet/device"}]}"#,
//! )
//! .expect("valid configuration");
//!
//! let backend = backend::Builder::new(config, pool)?
//!     .schema("example")
//!     .build()
//!     .await?;
//! let router = backend.router();
//! # let _ = router;
//! # Ok(())
//! # }
//! ```

use models::{BackendConfiguration, Catalog, Operation, Resource};
use std::collections::BTreeMap;
use std::sync::Arc;

mod access;
mod audit;
mod companion;
mod error;
mod etag;
mod intercept;
mod query;
mod routes;
mod schema;

pub use companion::{FilesystemStore, ObjectStore};
pub use error::Error;
pub use intercept::{InterceptRequest, Interceptor};
pub use query::{
    HEADER_PAGINATION_CURRENT_PAGE, HEADER_PAGINATION_LIMIT, HEADER_PAGINATION_NEXT_TOKEN,
    HEADER_PAGINATION_PAGE_COUNT, HEADER_PAGINATION_TOTAL_COUNT,
};
pub use schema::clear_schema;

/// Shared state behind every generated route handler.
pub(crate) struct Core {
    pub catalog: Catalog,
    pub pool: sqlx::PgPool,
    pub schema: String,
    pub pipeline: Arc<jobs::Pipeline>,
    pub interceptors: intercept::Registry,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub schemas: BTreeMap<String, jsonschema::Validator>,
    pub version: String,
}

impl Core {
    /// Validate a write against the resource's JSON schema, if one is
    /// configured.
    pub fn validate_schema(
        &self,
        resource: &Resource,
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), Error> {
        let Some(schema_id) = &resource.schema_id else {
            return Ok(());
        };
        let Some(validator) = self.schemas.get(schema_id) else {
            return Ok(());
        };
        let instance = serde_json::Value::Object(object.clone());
        let detail = validator
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        if detail.is_empty() {
            Ok(())
        } else {
            Err(Error::SchemaValidation(detail))
        }
    }
}

/// Builder for a [`Backend`]. All registration is done here; the handler
/// and interceptor registries are frozen once the backend is built, and
/// duplicate registrations are fatal.
pub struct Builder {
    catalog: Catalog,
    pool: sqlx::PgPool,
    schema: String,
    update_schema: bool,
    pipeline: jobs::PipelineBuilder,
    interceptors: intercept::Registry,
    object_store: Option<Arc<dyn ObjectStore>>,
    schema_documents: BTreeMap<String, serde_json::Value>,
}

impl Builder {
    /// Compile `config` into a resource catalog. Configuration errors are
    /// fatal here, before anything touches the database.
    pub fn new(config: BackendConfiguration, pool: sqlx::PgPool) -> Result<Self, Error> {
        let catalog =
            Catalog::compile(&config).map_err(|err| Error::validation(err.to_string()))?;

        let mut pipeline = jobs::PipelineBuilder::new();
        if let Some(concurrency) = config.pipeline_concurrency {
            pipeline = pipeline.concurrency(concurrency);
        }
        if let Some(max_attempts) = config.pipeline_max_attempts {
            pipeline = pipeline.max_attempts(max_attempts);
        }
        if let Some(timeouts) = &config.pipeline_retry_timeouts {
            pipeline = pipeline.retry_timeouts(
                timeouts
                    .iter()
                    .map(|secs| std::time::Duration::from_secs(*secs))
                    .collect(),
            );
        }

        Ok(Self {
            catalog,
            pool,
            schema: "kurbisio".to_string(),
            update_schema: true,
            pipeline,
            interceptors: intercept::Registry::default(),
            object_store: None,
            schema_documents: BTreeMap::new(),
        })
    }

    /// SQL schema holding the generated tables.
    pub fn schema(mut self, name: &str) -> Self {
        self.schema = name.to_string();
        self
    }

    /// Whether `build` creates and migrates the SQL schema.
    pub fn update_schema(mut self, update: bool) -> Self {
        self.update_schema = update;
        self
    }

    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Register the JSON schema document behind a configured `schema_id`.
    pub fn json_schema(mut self, id: &str, document: serde_json::Value) -> Self {
        self.schema_documents.insert(id.to_string(), document);
        self
    }

    /// Register a notification handler for operations on `resource`.
    /// Delivery is at-least-once; handlers must be idempotent. Registering
    /// twice for the same (resource, operation), or for an undeclared
    /// resource, is fatal.
    pub fn notification_handler(
        mut self,
        resource: &str,
        operations: &[Operation],
        handler: Arc<dyn jobs::NotificationHandler>,
    ) -> Self {
        if self.catalog.resource(resource).is_none() {
            panic!("notification handler references undeclared resource {resource:?}");
        }
        self.pipeline = self.pipeline.notification_handler(resource, operations, handler);
        self
    }

    /// Register an event handler. Delivery is at-least-once; handlers
    /// must be idempotent.
    pub fn event_handler(mut self, type_: &str, handler: Arc<dyn jobs::EventHandler>) -> Self {
        self.pipeline = self.pipeline.event_handler(type_, handler);
        self
    }

    /// Space deliveries of an event type by the given rate limit.
    pub fn event_rate_limit(mut self, type_: &str, limit: jobs::RateLimit) -> Self {
        self.pipeline = self.pipeline.rate_limit(type_, limit);
        self
    }

    /// Register an interceptor for one (resource, operation) pair.
    pub fn interceptor(
        mut self,
        resource: &str,
        operation: Operation,
        interceptor: Arc<dyn Interceptor>,
    ) -> Self {
        if self.catalog.resource(resource).is_none() {
            panic!("interceptor references undeclared resource {resource:?}");
        }
        self.interceptors.insert(resource, operation, interceptor);
        self
    }

    /// Ensure the SQL schema and freeze the registries.
    pub async fn build(self) -> Result<Backend, Error> {
        let mut schemas = BTreeMap::new();
        for resource in self.catalog.resources() {
            let Some(schema_id) = &resource.schema_id else {
                continue;
            };
            if schemas.contains_key(schema_id) {
                continue;
            }
            let document = self.schema_documents.get(schema_id).ok_or_else(|| {
                Error::validation(format!(
                    "resource {:?} references unknown schema {schema_id:?}",
                    resource.path
                ))
            })?;
            let validator = jsonschema::validator_for(document)
                .map_err(|err| Error::validation(format!("schema {schema_id:?}: {err}")))?;
            schemas.insert(schema_id.clone(), validator);
        }
        // Companion files need a store even without a schema id.
        for resource in self.catalog.resources() {
            if resource.with_companion_file && self.object_store.is_none() {
                return Err(Error::validation(format!(
                    "resource {:?} declares a companion file but no object store is configured",
                    resource.path
                )));
            }
        }

        if self.update_schema {
            schema::ensure_schema(&self.pool, &self.schema, &self.catalog).await?;
        }

        let pipeline = Arc::new(self.pipeline.build(self.pool.clone(), &self.schema));
        let core = Arc::new(Core {
            catalog: self.catalog,
            pool: self.pool,
            schema: self.schema,
            pipeline,
            interceptors: self.interceptors,
            object_store: self.object_store,
            schemas,
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        Ok(Backend { core })
    }
}

/// The generated backend: the compiled catalog, the router factory and
/// the job pipeline.
#[derive(Clone)]
pub struct Backend {
    core: Arc<Core>,
}

impl Backend {
    /// The generated REST surface. Authorization middleware is layered by
    /// the caller: requests carry a [`models::Authorization`] extension,
    /// and a request without one is treated as `public`.
    pub fn router(&self) -> axum::Router {
        routes::build_router(&self.core)
            .layer(tower_http::catch_panic::CatchPanicLayer::new())
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .layer(tower_http::cors::CorsLayer::permissive())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.core.catalog
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.core.pool
    }

    pub fn schema_name(&self) -> &str {
        &self.core.schema
    }

    pub fn pipeline(&self) -> Arc<jobs::Pipeline> {
        self.core.pipeline.clone()
    }

    /// Drive the job pipeline until `shutdown` resolves.
    pub async fn serve_pipeline(&self, shutdown: impl std::future::Future<Output = ()>) {
        self.core.pipeline.clone().serve(shutdown).await
    }

    /// Synchronously drain up to `max` jobs; returns whether more work
    /// remains. Intended for tests.
    pub async fn process_jobs(&self, max: usize) -> anyhow::Result<bool> {
        self.core.pipeline.process_jobs(max).await
    }
}
