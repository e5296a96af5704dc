use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use querygate::audit::{AuditSink, FileAuditSink, TracingAuditSink};
use querygate::config::{has_flag, GatewayConfig, USAGE};
use querygate::identity::SqlCredentialValidator;
use querygate::server::exec::SqlQueryExecutor;
use querygate::server::{shutdown_signal, GatewayState, Server};
use querygate::storage::BackingStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        print!("{}", USAGE);
        return Ok(());
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;
    fmt().with_env_filter(filter).init();

    let config = GatewayConfig::from_env_and_args(&args)?;
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "querygate starting: RUST_LOG='{}', bind={}, session_ttl={}s, max_connections={}, shutdown_grace={}s, reaper={:?}, audit_log={:?}",
        rust_log,
        config.bind_addr(),
        config.session_ttl.as_secs(),
        config.max_connections,
        config.shutdown_grace.as_secs(),
        config.reaper_interval,
        config.audit_log
    );

    let store = Arc::new(BackingStore::connect(&config.store).await.context("backing store unavailable")?);

    let file_sink = match &config.audit_log {
        Some(path) => Some(Arc::new(FileAuditSink::open(path).await?)),
        None => None,
    };
    let audit: Arc<dyn AuditSink> = match &file_sink {
        Some(sink) => sink.clone() as Arc<dyn AuditSink>,
        None => Arc::new(TracingAuditSink),
    };

    let state = GatewayState::new(
        &config,
        Arc::new(SqlCredentialValidator::new(store.clone())),
        Arc::new(SqlQueryExecutor::new(store.clone())),
        audit,
    );
    let (server, handle) = match Server::bind(&config, state).await {
        Ok(bound) => bound,
        Err(e) => {
            error!(target: "startup", "{:#}", e);
            store.close().await;
            return Err(e);
        }
    };
    let server = server.with_backing_store(store);

    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!(target: "querygate", "{} received, shutting down", signal);
        handle.shutdown();
    });

    let result = server.run().await;
    if let Some(sink) = file_sink {
        sink.close().await;
    }
    result
}
