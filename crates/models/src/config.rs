use crate::Operation;
use serde::{Deserialize, Serialize};

/// BackendConfiguration is the single JSON document from which the entire
/// REST surface is generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfiguration {
    #[serde(default)]
    pub collections: Vec<CollectionConfiguration>,
    #[serde(default)]
    pub singletons: Vec<SingletonConfiguration>,
    #[serde(default)]
    pub blobs: Vec<BlobConfiguration>,
    #[serde(default)]
    pub relations: Vec<RelationConfiguration>,
    #[serde(default)]
    pub shortcuts: Vec<ShortcutConfiguration>,

    /// Number of concurrent workers per pipeline drain cycle.
    #[serde(default)]
    pub pipeline_concurrency: Option<usize>,
    /// Number of delivery attempts before a job is parked as failed.
    #[serde(default)]
    pub pipeline_max_attempts: Option<i32>,
    /// Back-off before each retry, in seconds. Entry N delays the N+1'th
    /// attempt. Shorter sequences repeat their last entry.
    #[serde(default)]
    pub pipeline_retry_timeouts: Option<Vec<u64>>,
}

impl BackendConfiguration {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// A collection resource: many rows keyed by a UUID primary key,
/// optionally nested under a parent path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionConfiguration {
    /// Slash-separated resource path, such as `fleet/device`.
    pub resource: String,
    /// Optional unique text column, addressable in filters.
    #[serde(default)]
    pub external_index: Option<String>,
    /// Plain text columns, updatable through the fast static PUT route.
    #[serde(default)]
    pub static_properties: Vec<String>,
    /// Indexed text columns, addressable in filters and searches.
    #[serde(default)]
    pub searchable_properties: Vec<String>,
    /// JSON schema id to validate request bodies against.
    #[serde(default)]
    pub schema_id: Option<String>,
    /// Default values merged into rows on read and write.
    #[serde(default)]
    pub default: Option<serde_json::Map<String, serde_json::Value>>,
    /// Mirror every mutation into an append-only `<resource>_log` table.
    #[serde(default)]
    pub with_log: bool,
    /// Attach an externally stored companion file to each row.
    #[serde(default)]
    pub with_companion_file: bool,
    /// Validity of companion pre-signed URLs, in seconds.
    #[serde(default = "default_presigned_validity")]
    pub companion_presigned_url_validity: u64,
    /// Operations recorded in the audit log.
    #[serde(default)]
    pub audit_logs: Vec<Operation>,
    #[serde(default)]
    pub permits: Vec<Permit>,
}

/// A singleton resource: at most one row per parent tuple. The singleton's
/// primary key is its parent's primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SingletonConfiguration {
    pub resource: String,
    #[serde(default)]
    pub static_properties: Vec<String>,
    #[serde(default)]
    pub searchable_properties: Vec<String>,
    #[serde(default)]
    pub schema_id: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub with_log: bool,
    #[serde(default)]
    pub audit_logs: Vec<Operation>,
    #[serde(default)]
    pub permits: Vec<Permit>,
}

/// A blob resource: rows carry a binary payload served with its original
/// content type and a JSON meta-data header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobConfiguration {
    pub resource: String,
    #[serde(default)]
    pub external_index: Option<String>,
    #[serde(default)]
    pub static_properties: Vec<String>,
    #[serde(default)]
    pub searchable_properties: Vec<String>,
    /// Mutable blobs accept PUT and expose revision-aware ETags.
    #[serde(default)]
    pub mutable: bool,
    /// Store the payload in the configured object store instead of the
    /// blob table.
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub audit_logs: Vec<Operation>,
    #[serde(default)]
    pub permits: Vec<Permit>,
}

/// A symmetric many-to-many link between two collections. Both sides gain
/// virtual child routes listing, linking and unlinking the other side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationConfiguration {
    /// Resource path of the left collection.
    pub left: String,
    /// Resource path of the right collection.
    pub right: String,
}

/// A shortcut rewrites `<resource>/{id}` to `/<shortcut>` on all routes of
/// the target resource and its descendants. The hidden id is taken from the
/// caller's authorization selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShortcutConfiguration {
    pub shortcut: String,
    /// Resource path the shortcut stands in for.
    pub target: String,
    /// Roles which may use the shortcut.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Permit grants a role a set of operations on a resource. With selectors,
/// the grant is scoped to rows whose selector ids match the caller's.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permit {
    pub role: String,
    pub operations: Vec<Operation>,
    /// Selector names, such as `user`. The request path must carry a
    /// matching `{user_id}` equal to the caller's `user_id` selector.
    #[serde(default)]
    pub selectors: Vec<String>,
}

fn default_presigned_validity() -> u64 {
    900
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal_configuration() {
        let raw = serde_json::json!({
            "collections": [
                {"resource": "fleet"},
                {
                    "resource": "fleet/device",
                    "external_index": "serial_number",
                    "searchable_properties": ["model"],
                    "permits": [
                        {"role": "operator", "operations": ["read", "list"]}
                    ]
                }
            ],
            "singletons": [{"resource": "fleet/settings"}],
            "blobs": [{"resource": "fleet/device/photo", "mutable": true}],
            "shortcuts": [{"shortcut": "fleet", "target": "fleet", "roles": ["operator"]}]
        })
        .to_string();

        let config = BackendConfiguration::from_json(&raw).unwrap();
        assert_eq!(config.collections.len(), 2);
        assert_eq!(
            config.collections[1].external_index.as_deref(),
            Some("serial_number")
        );
        assert_eq!(config.collections[1].permits[0].operations.len(), 2);
        assert!(config.blobs[0].mutable);
        assert_eq!(config.singletons[0].resource, "fleet/settings");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"collections": [{"resource": "fleet", "serachable_properties": []}]}"#;
        assert!(BackendConfiguration::from_json(raw).is_err());
    }
}
