//! Shared backing-store connection.
//!
//! One `tokio-postgres` client is opened at startup and shared by the credential
//! validator and the query executor. The server closes it last, after every
//! connection handler has finished.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::{AppError, AppResult};

const DRIVER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BackingStore {
    client: RwLock<Option<Arc<Client>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl BackingStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let mut pg: tokio_postgres::Config = cfg.url.parse()
            .with_context(|| "invalid backing store connection string".to_string())?;
        if let Some(user) = cfg.user.as_deref() { pg.user(user); }
        if let Some(password) = cfg.password.as_deref() { pg.password(password); }
        let (client, connection) = pg.connect(NoTls).await
            .context("failed to connect to backing store")?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(target: "storage", "backing store connection error: {}", e);
            }
            debug!(target: "storage", "backing store driver finished");
        });
        info!(target: "storage", "backing store connected");
        Ok(Self { client: RwLock::new(Some(Arc::new(client))), driver: Mutex::new(Some(driver)) })
    }

    /// A store with no connection; every use fails with a data-access error.
    pub fn detached() -> Self {
        Self { client: RwLock::new(None), driver: Mutex::new(None) }
    }

    pub fn client(&self) -> AppResult<Arc<Client>> {
        self.client.read().clone()
            .ok_or_else(|| AppError::data_access("store_closed", "backing store is closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.client.read().is_none()
    }

    /// Release the connection. Idempotent.
    pub async fn close(&self) {
        let client = self.client.write().take();
        let driver = self.driver.lock().take();
        if client.is_none() && driver.is_none() { return; }
        drop(client);
        if let Some(mut h) = driver {
            // The driver completes once the last client handle is gone
            match tokio::time::timeout(DRIVER_CLOSE_TIMEOUT, &mut h).await {
                Ok(_) => info!(target: "storage", "backing store connection closed"),
                Err(_) => {
                    warn!(target: "storage", "backing store driver still busy after {:?}; aborting", DRIVER_CLOSE_TIMEOUT);
                    h.abort();
                }
            }
        }
    }
}
