//! Role-based access control and password hashing.
//!
//! The role catalog is built once at startup and never mutated afterwards, so
//! decisions read it without locking. A decision is a pure allow-list union over
//! the caller's active roles: no deny rules, no precedence.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Object name that grants an operation on every target.
pub const WILDCARD: &str = "*";

/// Explicit grant of one operation on one object (or on [`WILDCARD`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    operation: String,
    object: String,
}

impl Permission {
    pub fn new(operation: impl Into<String>, object: impl Into<String>) -> Self {
        Self { operation: operation.into(), object: object.into() }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Role {
    name: String,
    permissions: HashSet<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self { name: name.into(), permissions: permissions.into_iter().collect() }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Exact-match lookup; a wildcard grant is only found when asked for explicitly.
    pub fn has_permission(&self, p: &Permission) -> bool {
        self.permissions.contains(p)
    }
}

/// Immutable name -> role mapping shared by every connection.
#[derive(Debug, Default)]
pub struct RoleCatalog {
    roles: HashMap<String, Arc<Role>>,
}

impl RoleCatalog {
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        let roles = roles.into_iter().map(|r| (r.name.clone(), Arc::new(r))).collect();
        Self { roles }
    }

    /// The fixed admin / premium / free catalog. Every grant targets the wildcard object.
    pub fn standard() -> Self {
        fn wildcard_role(name: &str, ops: &[&str]) -> Role {
            Role::new(name, ops.iter().map(|op| Permission::new(*op, WILDCARD)))
        }
        Self::new([
            wildcard_role("admin", &["SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP"]),
            wildcard_role("premium", &["SELECT", "INSERT", "UPDATE"]),
            wildcard_role("free", &["SELECT"]),
        ])
    }

    pub fn get(&self, name: &str) -> Option<Arc<Role>> {
        self.roles.get(name).cloned()
    }

    pub fn len(&self) -> usize { self.roles.len() }
    pub fn is_empty(&self) -> bool { self.roles.is_empty() }
}

/// Permit iff any role holds `(operation, object)` or `(operation, "*")`.
pub fn authorize(roles: &[Arc<Role>], operation: &str, object: &str) -> bool {
    let exact = Permission::new(operation, object);
    let wildcard = Permission::new(operation, WILDCARD);
    roles.iter().any(|r| r.has_permission(&exact) || r.has_permission(&wildcard))
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}
