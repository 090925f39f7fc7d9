use crate::{BackendConfiguration, Operation, Permit, RESERVED_COLUMNS};
use std::collections::BTreeSet;

/// Route segment for a resource name: `device` lists under `/devices`,
/// `company` under `/companies`, `box` under `/boxes`.
pub fn plural(singular: &str) -> String {
    if let Some(stem) = singular.strip_suffix('y') {
        format!("{stem}ies")
    } else if singular.ends_with('s')
        || singular.ends_with('x')
        || singular.ends_with("ch")
        || singular.ends_with("sh")
    {
        format!("{singular}es")
    } else {
        format!("{singular}s")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Collection,
    Singleton,
    Blob,
}

/// Resource is a fully resolved resource descriptor, compiled from one
/// entry of the configuration document.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Slash-separated path, such as `fleet/device`.
    pub path: String,
    pub segments: Vec<String>,
    pub kind: Kind,
    pub external_index: Option<String>,
    pub static_properties: Vec<String>,
    pub searchable_properties: Vec<String>,
    pub schema_id: Option<String>,
    pub default: serde_json::Map<String, serde_json::Value>,
    pub with_log: bool,
    pub with_companion_file: bool,
    pub companion_presigned_url_validity: u64,
    pub audit_logs: BTreeSet<Operation>,
    /// Blobs only: whether PUT of a new payload is accepted.
    pub mutable: bool,
    /// Blobs only: payload lives in the object store, not the blob table.
    pub external: bool,
    pub permits: Vec<Permit>,
}

impl Resource {
    /// Final path segment, the resource's own name.
    pub fn this(&self) -> &str {
        self.segments.last().expect("resource path is never empty")
    }

    /// Ancestor segments, outermost first.
    pub fn ancestors(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    pub fn parent_path(&self) -> Option<String> {
        match self.ancestors() {
            [] => None,
            ancestors => Some(ancestors.join("/")),
        }
    }

    /// Primary key column, `<name>_id`.
    pub fn pk_column(&self) -> String {
        format!("{}_id", self.this())
    }

    /// Primary key columns of all ancestors, outermost first.
    pub fn ancestor_pk_columns(&self) -> Vec<String> {
        self.ancestors().iter().map(|s| format!("{s}_id")).collect()
    }

    /// Table name within the backend schema. The slash-separated path is
    /// kept verbatim; all SQL quotes it.
    pub fn table(&self) -> &str {
        &self.path
    }

    pub fn log_table(&self) -> String {
        format!("{}_log", self.path)
    }

    /// Path with slashes flattened, for index names and object store keys.
    pub fn sanitized(&self) -> String {
        self.path.replace('/', "_")
    }

    /// All declared property columns: static, searchable and the external
    /// index.
    pub fn property_columns(&self) -> Vec<&str> {
        self.static_properties
            .iter()
            .chain(self.searchable_properties.iter())
            .map(String::as_str)
            .chain(self.external_index.as_deref())
            .collect()
    }

    pub fn is_static_property(&self, name: &str) -> bool {
        self.static_properties.iter().any(|p| p == name)
    }

    pub fn is_searchable_property(&self, name: &str) -> bool {
        self.searchable_properties.iter().any(|p| p == name)
    }

    pub fn is_external_index(&self, name: &str) -> bool {
        self.external_index.as_deref() == Some(name)
    }

    /// Columns addressable by `filter=`: declared properties and ancestor
    /// primary keys.
    pub fn is_filterable_column(&self, name: &str) -> bool {
        self.is_static_property(name)
            || self.is_searchable_property(name)
            || self.is_external_index(name)
            || self.ancestor_pk_columns().iter().any(|c| c == name)
    }

    /// Columns addressable by `search=`: indexed columns only.
    pub fn is_indexed_column(&self, name: &str) -> bool {
        self.is_searchable_property(name)
            || self.is_external_index(name)
            || self.ancestor_pk_columns().iter().any(|c| c == name)
    }
}

/// A compiled shortcut: `/{shortcut}` stands in for
/// `/{plural(target)}/{target_id}`, with the id sourced from the caller's
/// authorization selectors.
#[derive(Debug, Clone)]
pub struct Shortcut {
    pub shortcut: String,
    pub target: String,
    pub roles: Vec<String>,
}

/// A compiled relation between two collections, backed by a symmetric
/// link table.
#[derive(Debug, Clone)]
pub struct Relation {
    pub left: String,
    pub right: String,
}

impl Relation {
    pub fn table(&self) -> String {
        format!(
            "relation_{}_{}",
            self.left.replace('/', "_"),
            self.right.replace('/', "_")
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("resource path {0:?} is not a valid slash-separated identifier path")]
    InvalidResourcePath(String),
    #[error("singleton {0:?} must be nested under a parent resource")]
    SingletonWithoutParent(String),
    #[error("resource {0:?} is declared more than once")]
    DuplicateResource(String),
    #[error("resource {path:?}: parent {parent:?} is not a declared collection or singleton")]
    MissingParent { path: String, parent: String },
    #[error("resource {path:?}: property {property:?} is not a valid identifier")]
    InvalidProperty { path: String, property: String },
    #[error("resource {path:?}: property {property:?} collides with a reserved column")]
    ReservedProperty { path: String, property: String },
    #[error("resource {path:?}: property {property:?} is declared more than once")]
    DuplicateProperty { path: String, property: String },
    #[error("resource {path:?}: audit log operation {operation} is not auditable")]
    InvalidAuditOperation { path: String, operation: Operation },
    #[error("shortcut {0:?} collides with a declared resource")]
    ShortcutCollision(String),
    #[error("shortcut {shortcut:?}: target {target:?} is not a declared resource")]
    MissingShortcutTarget { shortcut: String, target: String },
    #[error("relation {left:?} <-> {right:?}: {side:?} is not a declared collection")]
    InvalidRelationSide {
        left: String,
        right: String,
        side: String,
    },
}

/// Catalog is the fully resolved resource graph, compiled once at startup.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    resources: Vec<Resource>,
    shortcuts: Vec<Shortcut>,
    relations: Vec<Relation>,
}

impl Catalog {
    pub fn compile(config: &BackendConfiguration) -> Result<Self, CompileError> {
        let mut resources = Vec::new();

        for c in &config.collections {
            resources.push(Resource {
                path: c.resource.clone(),
                segments: split_path(&c.resource),
                kind: Kind::Collection,
                external_index: c.external_index.clone(),
                static_properties: c.static_properties.clone(),
                searchable_properties: c.searchable_properties.clone(),
                schema_id: c.schema_id.clone(),
                default: c.default.clone().unwrap_or_default(),
                with_log: c.with_log,
                with_companion_file: c.with_companion_file,
                companion_presigned_url_validity: c.companion_presigned_url_validity,
                audit_logs: c.audit_logs.iter().copied().collect(),
                mutable: false,
                external: false,
                permits: c.permits.clone(),
            });
        }
        for s in &config.singletons {
            resources.push(Resource {
                path: s.resource.clone(),
                segments: split_path(&s.resource),
                kind: Kind::Singleton,
                external_index: None,
                static_properties: s.static_properties.clone(),
                searchable_properties: s.searchable_properties.clone(),
                schema_id: s.schema_id.clone(),
                default: s.default.clone().unwrap_or_default(),
                with_log: s.with_log,
                with_companion_file: false,
                companion_presigned_url_validity: 0,
                audit_logs: s.audit_logs.iter().copied().collect(),
                mutable: false,
                external: false,
                permits: s.permits.clone(),
            });
        }
        for b in &config.blobs {
            resources.push(Resource {
                path: b.resource.clone(),
                segments: split_path(&b.resource),
                kind: Kind::Blob,
                external_index: b.external_index.clone(),
                static_properties: b.static_properties.clone(),
                searchable_properties: b.searchable_properties.clone(),
                schema_id: None,
                default: serde_json::Map::new(),
                with_log: false,
                with_companion_file: false,
                companion_presigned_url_validity: 0,
                audit_logs: b.audit_logs.iter().copied().collect(),
                mutable: b.mutable,
                external: b.external,
                permits: b.permits.clone(),
            });
        }

        // Parents must be created before children; cascading deletes walk
        // the reverse order.
        resources.sort_by_key(|r| (r.segments.len(), r.path.clone()));

        let catalog = Self {
            resources,
            shortcuts: config
                .shortcuts
                .iter()
                .map(|s| Shortcut {
                    shortcut: s.shortcut.clone(),
                    target: s.target.clone(),
                    roles: s.roles.clone(),
                })
                .collect(),
            relations: config
                .relations
                .iter()
                .map(|r| Relation {
                    left: r.left.clone(),
                    right: r.right.clone(),
                })
                .collect(),
        };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CompileError> {
        let mut seen = BTreeSet::new();
        for r in &self.resources {
            if r.segments.is_empty() || !r.segments.iter().all(|s| is_identifier(s)) {
                return Err(CompileError::InvalidResourcePath(r.path.clone()));
            }
            if r.kind == Kind::Singleton && r.segments.len() < 2 {
                return Err(CompileError::SingletonWithoutParent(r.path.clone()));
            }
            if !seen.insert(r.path.clone()) {
                return Err(CompileError::DuplicateResource(r.path.clone()));
            }
        }

        for r in &self.resources {
            // Every ancestor prefix must itself be declared, and blobs
            // cannot own children.
            for depth in 1..r.segments.len() {
                let parent = r.segments[..depth].join("/");
                match self.resource(&parent) {
                    Some(p) if p.kind != Kind::Blob => (),
                    _ => {
                        return Err(CompileError::MissingParent {
                            path: r.path.clone(),
                            parent,
                        })
                    }
                }
            }

            let mut columns: BTreeSet<&str> = BTreeSet::new();
            for property in r.property_columns() {
                if !is_identifier(property) {
                    return Err(CompileError::InvalidProperty {
                        path: r.path.clone(),
                        property: property.to_string(),
                    });
                }
                let reserved = RESERVED_COLUMNS.contains(&property)
                    || property == r.pk_column()
                    || r.ancestor_pk_columns().iter().any(|c| c == property);
                if reserved {
                    return Err(CompileError::ReservedProperty {
                        path: r.path.clone(),
                        property: property.to_string(),
                    });
                }
                if !columns.insert(property) {
                    return Err(CompileError::DuplicateProperty {
                        path: r.path.clone(),
                        property: property.to_string(),
                    });
                }
            }

            for operation in &r.audit_logs {
                if *operation == Operation::List {
                    return Err(CompileError::InvalidAuditOperation {
                        path: r.path.clone(),
                        operation: *operation,
                    });
                }
            }
        }

        for s in &self.shortcuts {
            if self.resource(&s.target).is_none() {
                return Err(CompileError::MissingShortcutTarget {
                    shortcut: s.shortcut.clone(),
                    target: s.target.clone(),
                });
            }
            if self.resources.iter().any(|r| r.segments[0] == s.shortcut) {
                return Err(CompileError::ShortcutCollision(s.shortcut.clone()));
            }
        }

        for rel in &self.relations {
            if rel.left == rel.right {
                return Err(CompileError::InvalidRelationSide {
                    left: rel.left.clone(),
                    right: rel.right.clone(),
                    side: rel.right.clone(),
                });
            }
            for side in [&rel.left, &rel.right] {
                match self.resource(side) {
                    Some(r) if r.kind == Kind::Collection => (),
                    _ => {
                        return Err(CompileError::InvalidRelationSide {
                            left: rel.left.clone(),
                            right: rel.right.clone(),
                            side: side.clone(),
                        })
                    }
                }
            }
        }

        Ok(())
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn shortcuts(&self) -> &[Shortcut] {
        &self.shortcuts
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn resource(&self, path: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.path == path)
    }

    /// Direct children of `path`.
    pub fn children_of<'c>(&'c self, path: &'c str) -> impl Iterator<Item = &'c Resource> {
        let depth = split_path(path).len();
        let prefix = format!("{path}/");
        self.resources
            .iter()
            .filter(move |r| r.segments.len() == depth + 1 && r.path.starts_with(&prefix))
    }

    /// All resources below `path`, deepest first, as a cascading delete
    /// must remove them.
    pub fn descendants_leaves_first(&self, path: &str) -> Vec<&Resource> {
        let prefix = format!("{path}/");
        let mut below: Vec<&Resource> = self
            .resources
            .iter()
            .filter(|r| r.path.starts_with(&prefix))
            .collect();
        below.sort_by_key(|r| std::cmp::Reverse(r.segments.len()));
        below
    }

    /// Relations in which `path` participates, with the opposite side.
    pub fn relations_of<'c>(&'c self, path: &'c str) -> impl Iterator<Item = (&'c Relation, &'c str)> {
        self.relations.iter().filter_map(move |rel| {
            if rel.left == path {
                Some((rel, rel.right.as_str()))
            } else if rel.right == path {
                Some((rel, rel.left.as_str()))
            } else {
                None
            }
        })
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/').map(str::to_string).collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::BackendConfiguration;

    fn compile(raw: serde_json::Value) -> Result<Catalog, CompileError> {
        let config: BackendConfiguration = serde_json::from_value(raw).unwrap();
        Catalog::compile(&config)
    }

    #[test]
    fn plural_rules() {
        assert_eq!(plural("device"), "devices");
        assert_eq!(plural("company"), "companies");
        assert_eq!(plural("box"), "boxes");
        assert_eq!(plural("alias"), "aliases");
        assert_eq!(plural("batch"), "batches");
    }

    #[test]
    fn resolves_parent_chain_and_order() {
        let catalog = compile(serde_json::json!({
            "collections": [
                {"resource": "fleet/device"},
                {"resource": "fleet"},
                {"resource": "fleet/device/measurement"}
            ]
        }))
        .unwrap();

        let paths: Vec<_> = catalog.resources().iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["fleet", "fleet/device", "fleet/device/measurement"]);

        let device = catalog.resource("fleet/device").unwrap();
        assert_eq!(device.pk_column(), "device_id");
        assert_eq!(device.ancestor_pk_columns(), ["fleet_id"]);

        let leaves: Vec<_> = catalog
            .descendants_leaves_first("fleet")
            .iter()
            .map(|r| r.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(leaves, ["fleet/device/measurement", "fleet/device"]);
    }

    #[test]
    fn rejects_undeclared_parent() {
        let err = compile(serde_json::json!({
            "collections": [{"resource": "fleet/device"}]
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::MissingParent { .. }));
    }

    #[test]
    fn rejects_reserved_property() {
        let err = compile(serde_json::json!({
            "collections": [{"resource": "fleet", "static_properties": ["revision"]}]
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::ReservedProperty { .. }));

        let err = compile(serde_json::json!({
            "collections": [{"resource": "fleet", "searchable_properties": ["fleet_id"]}]
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::ReservedProperty { .. }));
    }

    #[test]
    fn rejects_shortcut_without_target() {
        let err = compile(serde_json::json!({
            "collections": [{"resource": "fleet"}],
            "shortcuts": [{"shortcut": "mine", "target": "user"}]
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::MissingShortcutTarget { .. }));
    }

    #[test]
    fn rejects_relation_to_singleton() {
        let err = compile(serde_json::json!({
            "collections": [{"resource": "user"}],
            "singletons": [{"resource": "user/profile"}],
            "relations": [{"left": "user", "right": "user/profile"}]
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidRelationSide { .. }));
    }

    #[test]
    fn blobs_cannot_own_children() {
        let err = compile(serde_json::json!({
            "collections": [{"resource": "fleet"}, {"resource": "fleet/photo/comment"}],
            "blobs": [{"resource": "fleet/photo"}]
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::MissingParent { .. }));
    }

    #[test]
    fn filterable_and_indexed_columns() {
        let catalog = compile(serde_json::json!({
            "collections": [
                {"resource": "fleet"},
                {
                    "resource": "fleet/device",
                    "external_index": "serial_number",
                    "static_properties": ["label"],
                    "searchable_properties": ["model"]
                }
            ]
        }))
        .unwrap();

        let device = catalog.resource("fleet/device").unwrap();
        assert!(device.is_filterable_column("label"));
        assert!(device.is_filterable_column("fleet_id"));
        assert!(!device.is_indexed_column("label"));
        assert!(device.is_indexed_column("model"));
        assert!(device.is_indexed_column("serial_number"));
    }
}
