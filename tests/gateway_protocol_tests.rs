mod support;

use std::sync::Arc;
use std::time::Duration;

use querygate::audit::{AuditKind, Verdict};
use querygate::client::GatewayClient;
use querygate::identity::LocalCredentialValidator;
use querygate::server::handler::{ACCESS_DENIED, AUTH_FAILED, AUTH_OK_PREFIX, SESSION_EXPIRED};
use support::*;

const SELECT_Q: &str = "SELECT * FROM Contenuto LIMIT 5";
const DELETE_Q: &str = "DELETE FROM Contenuto WHERE idContenuto=1";
const INSERT_Q: &str = "INSERT INTO Contenuto (nome, duarata, riproduzione, tipo) VALUES ('New Song', 180, 0, 1)";
const UPDATE_Q: &str = "UPDATE Contenuto SET nome = 'Test Title' WHERE idContenuto = 1";

async fn login(gw: &TestGateway, who: (&str, &str)) -> GatewayClient {
    let mut c = GatewayClient::connect(gw.addr).await.expect("connect");
    let reply = c.authenticate(who.0, who.1).await.expect("auth round trip");
    assert!(reply.starts_with(AUTH_OK_PREFIX), "unexpected auth reply: {reply}");
    c
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn free_select_is_executed_with_tabular_reply() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = login(&gw, FREE).await;
    let reply = c.query(SELECT_Q).await.unwrap();
    assert_eq!(reply, "idContenuto\tnome\t\n1\tSong\t\n");
    assert_eq!(gw.executor.calls(), 1);
    c.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn free_delete_is_denied_without_execution() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = login(&gw, FREE).await;
    assert_eq!(c.query(DELETE_Q).await.unwrap(), ACCESS_DENIED);
    assert_eq!(c.query(UPDATE_Q).await.unwrap(), ACCESS_DENIED);
    assert_eq!(c.query(INSERT_Q).await.unwrap(), ACCESS_DENIED);
    assert_eq!(gw.executor.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn premium_insert_permitted_and_delete_denied() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = login(&gw, PREMIUM).await;
    assert_eq!(c.query(INSERT_Q).await.unwrap(), "1 rows affected");
    assert_eq!(c.query(UPDATE_Q).await.unwrap(), "1 rows affected");
    assert_eq!(gw.executor.calls(), 2);
    assert_eq!(c.query(DELETE_Q).await.unwrap(), ACCESS_DENIED);
    assert_eq!(gw.executor.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_runs_every_operation() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = login(&gw, ADMIN).await;
    for q in [SELECT_Q, INSERT_Q, UPDATE_Q, DELETE_Q, "CREATE TABLE Playlist (id INT)", "DROP TABLE Playlist"] {
        assert_ne!(c.query(q).await.unwrap(), ACCESS_DENIED, "admin denied: {q}");
    }
    assert_eq!(gw.executor.calls(), 6);
    // not in any role's grants
    assert_eq!(c.query("TRUNCATE TABLE Contenuto").await.unwrap(), ACCESS_DENIED);
    assert_eq!(c.query("").await.unwrap(), ACCESS_DENIED);
    assert_eq!(gw.executor.calls(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_email_creates_no_session() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = GatewayClient::connect(gw.addr).await.unwrap();
    assert_eq!(c.authenticate("nobody@example.com", "x").await.unwrap(), AUTH_FAILED);
    assert_eq!(c.authenticate(FREE.0, "wrong").await.unwrap(), AUTH_FAILED);
    assert!(c.session_id().is_none());
    assert!(gw.state.sessions.is_empty());
    // the connection stays usable after a failed AUTH
    assert!(c.authenticate(FREE.0, FREE.1).await.unwrap().starts_with(AUTH_OK_PREFIX));
    assert_eq!(gw.state.sessions.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_auth_yields_distinct_valid_sessions() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = login(&gw, PREMIUM).await;
    let first = c.session_id().unwrap().to_string();
    c.authenticate(PREMIUM.0, PREMIUM.1).await.unwrap();
    let second = c.session_id().unwrap().to_string();
    assert_ne!(first, second);
    assert_eq!(gw.state.sessions.len(), 2);
    assert_eq!(c.query_with_session(&first, SELECT_Q).await.unwrap().lines().count(), 2);
    assert_eq!(c.query_with_session(&second, SELECT_Q).await.unwrap().lines().count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_is_visible_from_another_connection() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let a = login(&gw, PREMIUM).await;
    let sid = a.session_id().unwrap().to_string();
    let mut b = GatewayClient::connect(gw.addr).await.unwrap();
    assert_eq!(b.query_with_session(&sid, INSERT_Q).await.unwrap(), "1 rows affected");
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_session_never_reaches_executor() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = GatewayClient::connect(gw.addr).await.unwrap();
    assert_eq!(c.query_with_session("not-a-session", SELECT_Q).await.unwrap(), SESSION_EXPIRED);
    assert_eq!(c.query_with_session("", DELETE_Q).await.unwrap(), SESSION_EXPIRED);
    // no remembered session: refused locally
    assert_eq!(c.query(SELECT_Q).await.unwrap(), SESSION_EXPIRED);
    assert_eq!(gw.executor.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activity_slides_the_expiry_window() {
    let cfg = querygate::config::GatewayConfig { session_ttl: Duration::from_millis(600), ..test_config() };
    let gw = start_gateway(cfg, CountingExecutor::default()).await;
    let mut c = login(&gw, FREE).await;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_ne!(c.query(SELECT_Q).await.unwrap(), SESSION_EXPIRED);
    }
    assert_eq!(gw.executor.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_session_expires() {
    let cfg = querygate::config::GatewayConfig { session_ttl: Duration::from_millis(300), ..test_config() };
    let gw = start_gateway(cfg, CountingExecutor::default()).await;
    let mut c = login(&gw, PREMIUM).await;
    assert_ne!(c.query(SELECT_Q).await.unwrap(), SESSION_EXPIRED);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(c.query(SELECT_Q).await.unwrap(), SESSION_EXPIRED);
    assert_eq!(gw.executor.calls(), 1);
    // lazy expiry: the entry stays resident without a reaper
    assert_eq!(gw.state.sessions.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reaper_purges_expired_sessions_when_enabled() {
    let cfg = querygate::config::GatewayConfig {
        session_ttl: Duration::from_millis(100),
        reaper_interval: Some(Duration::from_millis(100)),
        ..test_config()
    };
    let gw = start_gateway(cfg, CountingExecutor::default()).await;
    let _c = login(&gw, FREE).await;
    assert_eq!(gw.state.sessions.len(), 1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !gw.state.sessions.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "session never purged");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_outcome_is_audited_once() {
    let gw = start_gateway(test_config(), CountingExecutor::default()).await;
    let mut c = GatewayClient::connect(gw.addr).await.unwrap();
    c.authenticate("nobody@example.com", "x").await.unwrap();
    c.authenticate(FREE.0, FREE.1).await.unwrap();
    let sid = c.session_id().unwrap().to_string();
    c.query(SELECT_Q).await.unwrap();
    c.query(DELETE_Q).await.unwrap();
    c.query_with_session("stale", SELECT_Q).await.unwrap();

    // events are recorded just after each reply is written
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while gw.audit.events().len() < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = gw.audit.events();
    let verdicts: Vec<Verdict> = events.iter().map(|e| e.verdict).collect();
    assert_eq!(verdicts, vec![Verdict::Rejected, Verdict::Authenticated, Verdict::Executed, Verdict::Denied, Verdict::SessionExpired]);
    assert_eq!(events[1].kind, AuditKind::Auth);
    assert_eq!(events[1].session_id.as_deref(), Some(sid.as_str()));
    assert_eq!(events[1].role.as_deref(), Some("free"));
    assert_eq!(events[3].kind, AuditKind::Query);
    assert_eq!(events[3].principal.as_deref(), Some(FREE.0));
    assert_eq!(events[3].query.as_deref(), Some(DELETE_Q));
    assert!(events.iter().all(|e| e.client_id == events[0].client_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hashed_local_accounts_authenticate() {
    let users = LocalCredentialValidator::new();
    users.add_user(PREMIUM.0, PREMIUM.1, "premium").unwrap();
    let gw = start_gateway_with(test_config(), Arc::new(users), CountingExecutor::default()).await;
    let mut c = GatewayClient::connect(gw.addr).await.unwrap();
    assert_eq!(c.authenticate(PREMIUM.0, "anna05").await.unwrap(), AUTH_FAILED);
    assert!(c.authenticate(PREMIUM.0, PREMIUM.1).await.unwrap().starts_with(AUTH_OK_PREFIX));
    assert_eq!(c.query(INSERT_Q).await.unwrap(), "1 rows affected");
}
