mod authorization;
mod catalog;
mod config;
mod operation;

pub use authorization::{
    Authorization, ROLE_ADMIN, ROLE_ADMIN_VIEWER, ROLE_EVERYBODY, ROLE_PUBLIC,
};
pub use catalog::{plural, Catalog, CompileError, Kind, Relation, Resource, Shortcut};
pub use config::{
    BackendConfiguration, BlobConfiguration, CollectionConfiguration, Permit,
    RelationConfiguration, ShortcutConfiguration, SingletonConfiguration,
};
pub use operation::Operation;

/// Columns present on every resource row, which property names may not shadow.
pub const RESERVED_COLUMNS: &[&str] = &["timestamp", "revision", "properties"];
