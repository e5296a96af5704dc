use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::security::{hash_password, verify_password};
use crate::storage::BackingStore;

/// Checks a principal's credentials and resolves the role label bound to it.
///
/// `Ok(None)` is a plain mismatch. `Err` means the check itself could not be
/// carried out (store unavailable, malformed data).
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn authenticate(&self, email: &str, password: &str) -> AppResult<Option<String>>;
}

struct LocalUser {
    password_hash: String,
    role: String,
}

/// In-memory principal table with Argon2 password hashes.
#[derive(Default)]
pub struct LocalCredentialValidator {
    users: RwLock<HashMap<String, LocalUser>>,
}

impl LocalCredentialValidator {
    pub fn new() -> Self { Self::default() }

    /// Register or replace a principal.
    pub fn add_user(&self, email: &str, password: &str, role: &str) -> Result<()> {
        let password_hash = hash_password(password)?;
        self.users.write().insert(email.to_string(), LocalUser { password_hash, role: role.to_string() });
        Ok(())
    }

    pub fn remove_user(&self, email: &str) -> bool {
        self.users.write().remove(email).is_some()
    }
}

#[async_trait]
impl CredentialValidator for LocalCredentialValidator {
    async fn authenticate(&self, email: &str, password: &str) -> AppResult<Option<String>> {
        let entry = {
            let users = self.users.read();
            users.get(email).map(|u| (u.password_hash.clone(), u.role.clone()))
        };
        let Some((phc, role)) = entry else { return Ok(None); };
        // Argon2 verification is CPU-bound
        let password = password.to_string();
        let ok = tokio::task::spawn_blocking(move || verify_password(&phc, &password))
            .await
            .map_err(|e| AppError::internal("verify_join", e.to_string().as_str()))?;
        Ok(ok.then_some(role))
    }
}

const CREDENTIAL_QUERY: &str = "SELECT CAST(u.tipo AS INTEGER) AS tipo FROM Utente u WHERE u.email = $1 AND u.passw = $2";

/// Map the `Utente.tipo` account type to a role label.
///
/// 0 is free, 1 is premium and 2 is admin. Any other value yields `None`, which
/// the validator reports as an error. Older deployments treated every non-zero
/// type as premium and had no admin accounts in the table.
pub fn role_for_account_type(tipo: i32) -> Option<&'static str> {
    match tipo {
        0 => Some("free"),
        1 => Some("premium"),
        2 => Some("admin"),
        _ => None,
    }
}

/// Validates against the `Utente` table of the backing store.
pub struct SqlCredentialValidator {
    store: Arc<BackingStore>,
}

impl SqlCredentialValidator {
    pub fn new(store: Arc<BackingStore>) -> Self { Self { store } }
}

#[async_trait]
impl CredentialValidator for SqlCredentialValidator {
    async fn authenticate(&self, email: &str, password: &str) -> AppResult<Option<String>> {
        let client = self.store.client()?;
        let row = client.query_opt(CREDENTIAL_QUERY, &[&email, &password]).await?;
        let Some(row) = row else {
            debug!(target: "auth", "no credential match for '{}'", email);
            return Ok(None);
        };
        let tipo: i32 = row.try_get(0)?;
        match role_for_account_type(tipo) {
            Some(role) => Ok(Some(role.to_string())),
            None => Err(AppError::data_access("bad_account_type", format!("unsupported account type {}", tipo).as_str())),
        }
    }
}
