#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use querygate::audit::{AuditEvent, AuditSink};
use querygate::config::GatewayConfig;
use querygate::error::AppResult;
use querygate::identity::CredentialValidator;
use querygate::server::exec::{is_select, QueryExecutor, QueryOutput};
use querygate::server::{GatewayState, Server, ShutdownHandle};

pub const FREE: (&str, &str) = ("margheritaursino@gmail.com", "marghe02");
pub const PREMIUM: (&str, &str) = ("annapistorio@gmail.com", "anna04");
pub const ADMIN: (&str, &str) = ("root@streaming.example", "r00t!");

/// Counts executions and answers with a canned result.
#[derive(Default)]
pub struct CountingExecutor {
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl CountingExecutor {
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl QueryExecutor for CountingExecutor {
    async fn execute(&self, query: &str) -> AppResult<QueryOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay { tokio::time::sleep(d).await; }
        if is_select(query) {
            Ok(QueryOutput::Table { columns: vec!["idContenuto".into(), "nome".into()], rows: vec![vec![Some("1".into()), Some("Song".into())]] })
        } else {
            Ok(QueryOutput::RowsAffected(1))
        }
    }
}

#[derive(Default)]
pub struct RecordingSink(pub Mutex<Vec<AuditEvent>>);

impl RecordingSink {
    pub fn events(&self) -> Vec<AuditEvent> { self.0.lock().clone() }
}

impl AuditSink for RecordingSink {
    fn record(&self, event: AuditEvent) { self.0.lock().push(event); }
}

pub struct Guard(pub JoinHandle<anyhow::Result<()>>);

impl Drop for Guard {
    fn drop(&mut self) { self.0.abort(); }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub handle: ShutdownHandle,
    pub state: Arc<GatewayState>,
    pub executor: Arc<CountingExecutor>,
    pub audit: Arc<RecordingSink>,
    pub guard: Guard,
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        audit_log: None,
        shutdown_grace: Duration::from_secs(5),
        ..GatewayConfig::default()
    }
}

/// Plaintext account table standing in for the `Utente` lookup.
pub struct StaticValidator;

#[async_trait]
impl CredentialValidator for StaticValidator {
    async fn authenticate(&self, email: &str, password: &str) -> AppResult<Option<String>> {
        let role = [(FREE, "free"), (PREMIUM, "premium"), (ADMIN, "admin")]
            .into_iter()
            .find(|((e, p), _)| *e == email && *p == password)
            .map(|(_, role)| role.to_string());
        Ok(role)
    }
}

pub async fn start_gateway(config: GatewayConfig, executor: CountingExecutor) -> TestGateway {
    start_gateway_with(config, Arc::new(StaticValidator), executor).await
}

pub async fn start_gateway_with(config: GatewayConfig, validator: Arc<dyn CredentialValidator>, executor: CountingExecutor) -> TestGateway {
    let executor = Arc::new(executor);
    let audit = Arc::new(RecordingSink::default());
    let state = GatewayState::new(&config, validator, executor.clone(), audit.clone());
    let (server, handle) = Server::bind(&config, state).await.expect("bind 127.0.0.1:0");
    let addr = server.local_addr().expect("local addr");
    let state = server.state();
    let guard = Guard(tokio::spawn(server.run()));
    TestGateway { addr, handle, state, executor, audit, guard }
}
