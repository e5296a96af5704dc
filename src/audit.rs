//! Audit trail for authentication and query outcomes.
//!
//! The connection handler calls [`AuditSink::record`] once per AUTH/QUERY, after
//! the reply has been written. Sinks must return immediately: the file sink only
//! enqueues, and drops events when its queue is full.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind { Auth, Query }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Authenticated,
    Rejected,
    AuthError,
    Executed,
    Denied,
    SessionExpired,
    ExecError,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Authenticated | Verdict::Executed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub client_id: String,
    pub session_id: Option<String>,
    pub principal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub verdict: Verdict,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn auth(client_id: &str, principal: &str, verdict: Verdict) -> Self {
        Self {
            kind: AuditKind::Auth,
            client_id: client_id.to_string(),
            session_id: None,
            principal: Some(principal.to_string()),
            role: None,
            query: None,
            verdict,
            timestamp: Utc::now(),
        }
    }

    pub fn query(client_id: &str, session_id: &str, query: &str, verdict: Verdict) -> Self {
        Self {
            kind: AuditKind::Query,
            client_id: client_id.to_string(),
            session_id: Some(session_id.to_string()),
            principal: None,
            role: None,
            query: Some(query.to_string()),
            verdict,
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self { self.session_id = Some(session_id.to_string()); self }
    pub fn with_principal(mut self, principal: &str) -> Self { self.principal = Some(principal.to_string()); self }
    pub fn with_role(mut self, role: &str) -> Self { self.role = Some(role.to_string()); self }
}

/// Best-effort observer of request outcomes. Must not block or fail.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Emits each event as a structured log line on the `audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, e: AuditEvent) {
        info!(
            target: "audit",
            kind = ?e.kind,
            client = %e.client_id,
            session = e.session_id.as_deref().unwrap_or("-"),
            principal = e.principal.as_deref().unwrap_or("-"),
            role = e.role.as_deref().unwrap_or("-"),
            verdict = ?e.verdict,
            success = e.verdict.is_success(),
            "{}",
            e.query.as_deref().unwrap_or("")
        );
    }
}

pub const DEFAULT_AUDIT_QUEUE: usize = 4096;
/// Size after which the audit file is rotated to `<path>.1`.
pub const DEFAULT_AUDIT_FILE_LIMIT: u64 = 1024 * 1024;

/// Appends events as JSON lines from a background writer task.
pub struct FileAuditSink {
    tx: RwLock<Option<mpsc::Sender<AuditEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    path: PathBuf,
}

impl FileAuditSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DEFAULT_AUDIT_QUEUE, DEFAULT_AUDIT_FILE_LIMIT).await
    }

    pub async fn open_with(path: impl AsRef<Path>, queue: usize, file_limit: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path).await?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        let (tx, rx) = mpsc::channel(queue.max(1));
        let writer = tokio::spawn(write_loop(path.clone(), file, size, file_limit, rx));
        info!(target: "audit", "audit log opened at {}", path.display());
        Ok(Self { tx: RwLock::new(Some(tx)), writer: Mutex::new(Some(writer)), dropped: AtomicU64::new(0), path })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Events discarded because the queue was full or the sink closed.
    pub fn dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }

    /// Stop accepting events and wait for the queue to be written out.
    pub async fn close(&self) {
        let tx = self.tx.write().take();
        drop(tx);
        let writer = self.writer.lock().take();
        if let Some(h) = writer {
            if let Err(e) = h.await {
                error!(target: "audit", "audit writer task failed: {}", e);
            }
            info!(target: "audit", "audit log closed ({} event(s) dropped)", self.dropped());
        }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        let sent = match self.tx.read().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        };
        if !sent {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                warn!(target: "audit", "audit queue unavailable, {} event(s) dropped so far", n);
            }
        }
    }
}

async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await.ok();
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open audit log {}", path.display()))
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".1");
    PathBuf::from(s)
}

async fn write_loop(path: PathBuf, mut file: tokio::fs::File, mut size: u64, limit: u64, mut rx: mpsc::Receiver<AuditEvent>) {
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(s) => s,
            Err(e) => { error!(target: "audit", "failed to encode audit event: {}", e); continue; }
        };
        line.push('\n');
        if size > 0 && size + line.len() as u64 > limit {
            let _ = file.flush().await;
            if let Err(e) = tokio::fs::rename(&path, rotated_path(&path)).await {
                warn!(target: "audit", "audit log rotation failed: {}", e);
            }
            match open_append(&path).await {
                Ok(f) => { file = f; size = 0; }
                Err(e) => { error!(target: "audit", "{:#}", e); continue; }
            }
        }
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(target: "audit", "failed to write audit event: {}", e);
            continue;
        }
        size += line.len() as u64;
        if let Err(e) = file.flush().await {
            error!(target: "audit", "failed to flush audit log: {}", e);
        }
    }
}
