use std::collections::{BTreeMap, BTreeSet};

/// Role which bypasses all permit checks.
pub const ROLE_ADMIN: &str = "admin";
/// Role which bypasses permit checks for read and list operations only.
pub const ROLE_ADMIN_VIEWER: &str = "admin viewer";
/// Role of an unauthenticated caller.
pub const ROLE_PUBLIC: &str = "public";
/// Pseudo-role in permits which matches any caller, authenticated or not.
pub const ROLE_EVERYBODY: &str = "everybody";

/// Authorization is the verified identity of a caller: the roles it holds
/// and the selector ids it is scoped to (for example `user_id`).
///
/// Authorizations are produced by middleware outside this crate (session
/// lookup, JWT verification, ...) and attached to the request. A request
/// without an Authorization is treated as `public`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Authorization {
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,
}

impl Default for Authorization {
    fn default() -> Self {
        Self::public()
    }
}

impl Authorization {
    /// The authorization of an unauthenticated caller.
    pub fn public() -> Self {
        Self {
            roles: [ROLE_PUBLIC.to_string()].into(),
            selectors: BTreeMap::new(),
        }
    }

    pub fn admin() -> Self {
        Self {
            roles: [ROLE_ADMIN.to_string()].into(),
            selectors: BTreeMap::new(),
        }
    }

    pub fn with_role(role: &str) -> Self {
        Self {
            roles: [role.to_string()].into(),
            selectors: BTreeMap::new(),
        }
    }

    pub fn with_selector(mut self, name: &str, id: &str) -> Self {
        self.selectors.insert(name.to_string(), id.to_string());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Selector value for `name`, where `name` is a selector column such
    /// as `user_id`.
    pub fn selector(&self, name: &str) -> Option<&str> {
        self.selectors.get(name).map(String::as_str)
    }
}
