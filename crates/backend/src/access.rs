//! Permit evaluation against the caller's [`Authorization`].

use crate::error::Error;
use models::{
    Authorization, Operation, Resource, ROLE_ADMIN, ROLE_ADMIN_VIEWER, ROLE_EVERYBODY, ROLE_PUBLIC,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Ids resolved from the request path, keyed by column (`fleet_id`).
/// `None` marks the wildcard id `all`.
pub type PathIds = BTreeMap<String, Option<Uuid>>;

/// Authorize `operation` on `resource` for the caller, per the resource's
/// permits. Denial is a 401.
pub fn authorize(
    resource: &Resource,
    auth: &Authorization,
    operation: Operation,
    path_ids: &PathIds,
) -> Result<(), Error> {
    if authorized(&resource.permits, auth, operation, path_ids) {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

/// Permit evaluation without a resource at hand (relations, where the
/// permits of the traversed side apply).
pub fn authorized(
    permits: &[models::Permit],
    auth: &Authorization,
    operation: Operation,
    path_ids: &PathIds,
) -> bool {
    if auth.has_role(ROLE_ADMIN) {
        return true;
    }
    if auth.has_role(ROLE_ADMIN_VIEWER)
        && matches!(operation, Operation::Read | Operation::List)
    {
        return true;
    }

    permits.iter().any(|permit| {
        if !permit.operations.contains(&operation) {
            return false;
        }
        let role_matches = permit.role == ROLE_EVERYBODY
            || permit.role == ROLE_PUBLIC
            || auth.has_role(&permit.role);
        if !role_matches {
            return false;
        }
        // Selector-scoped permits require the request to address the
        // caller's own id: the path carries a concrete id for the
        // selector column, equal to the caller's selector value.
        permit.selectors.iter().all(|selector| {
            let column = format!("{selector}_id");
            let path_id = match path_ids.get(&column) {
                Some(Some(id)) => *id,
                _ => return false,
            };
            match auth.selector(&column).map(|v| v.parse::<Uuid>()) {
                Some(Ok(own)) => own == path_id,
                _ => false,
            }
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{BackendConfiguration, Catalog};

    fn resource_with_permits(permits: serde_json::Value) -> Resource {
        let config: BackendConfiguration = serde_json::from_value(serde_json::json!({
            "collections": [
                {"resource": "user"},
                {"resource": "user/note", "permits": permits}
            ]
        }))
        .unwrap();
        Catalog::compile(&config)
            .unwrap()
            .resource("user/note")
            .unwrap()
            .clone()
    }

    fn ids(pairs: &[(&str, Uuid)]) -> PathIds {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Some(*v)))
            .collect()
    }

    #[test]
    fn admin_bypasses_everything() {
        let resource = resource_with_permits(serde_json::json!([]));
        let admin = Authorization::admin();
        for operation in [Operation::Create, Operation::Delete, Operation::Clear] {
            assert!(authorize(&resource, &admin, operation, &PathIds::new()).is_ok());
        }
    }

    #[test]
    fn admin_viewer_reads_only() {
        let resource = resource_with_permits(serde_json::json!([]));
        let viewer = Authorization::with_role(ROLE_ADMIN_VIEWER);
        assert!(authorize(&resource, &viewer, Operation::Read, &PathIds::new()).is_ok());
        assert!(authorize(&resource, &viewer, Operation::List, &PathIds::new()).is_ok());
        assert!(authorize(&resource, &viewer, Operation::Update, &PathIds::new()).is_err());
    }

    #[test]
    fn role_and_operation_must_both_match() {
        let resource = resource_with_permits(serde_json::json!([
            {"role": "author", "operations": ["create", "read"]}
        ]));
        let author = Authorization::with_role("author");
        assert!(authorize(&resource, &author, Operation::Create, &PathIds::new()).is_ok());
        assert!(authorize(&resource, &author, Operation::Delete, &PathIds::new()).is_err());

        let other = Authorization::with_role("reader");
        assert!(authorize(&resource, &other, Operation::Read, &PathIds::new()).is_err());
    }

    #[test]
    fn everybody_matches_unauthenticated_callers() {
        let resource = resource_with_permits(serde_json::json!([
            {"role": "everybody", "operations": ["read"]}
        ]));
        assert!(authorize(&resource, &Authorization::public(), Operation::Read, &PathIds::new()).is_ok());
    }

    #[test]
    fn selector_permit_requires_matching_path_id() {
        let resource = resource_with_permits(serde_json::json!([
            {"role": "user", "operations": ["read", "list"], "selectors": ["user"]}
        ]));
        let own = Uuid::new_v4();
        let caller =
            Authorization::with_role("user").with_selector("user_id", &own.to_string());

        assert!(authorize(&resource, &caller, Operation::Read, &ids(&[("user_id", own)])).is_ok());

        // A foreign id, a wildcard, or a missing segment all deny.
        let foreign = Uuid::new_v4();
        assert!(
            authorize(&resource, &caller, Operation::Read, &ids(&[("user_id", foreign)])).is_err()
        );
        let mut wildcard = PathIds::new();
        wildcard.insert("user_id".to_string(), None);
        assert!(authorize(&resource, &caller, Operation::Read, &wildcard).is_err());
        assert!(authorize(&resource, &caller, Operation::Read, &PathIds::new()).is_err());
    }
}
