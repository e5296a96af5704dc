//! Query introspection.
//!
//! Extracts the (operation, object) pair the RBAC gate decides on. This is a
//! fixed-shape heuristic over `VERB ... (FROM|INTO|UPDATE) TARGET ...`, not a
//! parser: joins, subqueries, quoted identifiers and keyword-like literals are
//! misclassified, and authorization outcomes depend on exactly that behaviour.

use crate::security::WILDCARD;

/// Keywords whose following token names the object a statement targets.
const TARGET_KEYWORDS: [&str; 3] = ["FROM", "INTO", "UPDATE"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryTarget {
    pub operation: String,
    pub object: String,
}

/// Uppercase, trim, split on whitespace. Operation is the first token; object is
/// the token after the first FROM/INTO/UPDATE, or `*` when there is none.
pub fn introspect(query: &str) -> QueryTarget {
    let upper = query.trim().to_uppercase();
    let tokens: Vec<&str> = upper.split_whitespace().collect();
    let operation = tokens.first().copied().unwrap_or_default().to_string();
    let object = tokens
        .iter()
        .position(|t| TARGET_KEYWORDS.contains(t))
        .and_then(|i| tokens.get(i + 1))
        .copied()
        .unwrap_or(WILDCARD)
        .to_string();
    QueryTarget { operation, object }
}
