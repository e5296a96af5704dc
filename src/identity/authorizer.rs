use std::sync::Arc;

use crate::security::{self, Role};
use crate::server::query::{introspect, QueryTarget};

/// Outcome of gating one query against a role set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub target: QueryTarget,
    pub permitted: bool,
}

/// Extract the (operation, object) a query targets and check it against `roles`.
pub fn check_query_allowed(roles: &[Arc<Role>], query: &str) -> Decision {
    let target = introspect(query);
    let permitted = security::authorize(roles, &target.operation, &target.object);
    Decision { target, permitted }
}
