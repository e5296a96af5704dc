//! Per-connection protocol state machine.
//!
//! `AWAITING_COMMAND -> {AUTH, QUERY} -> AWAITING_COMMAND`, ending on `EXIT`, on a
//! clean close, or on the first transport/framing error. Outcomes of AUTH and
//! QUERY are always answered in-band; only transport failures end the connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, Verdict};
use crate::identity::{check_query_allowed, ConnContext};
use crate::server::wire::{read_frame, write_frame, FrameError, CMD_AUTH, CMD_EXIT, CMD_QUERY, MAX_FRAME_LEN};
use crate::server::GatewayState;

pub const AUTH_OK_PREFIX: &str = "Authentication successful:";
pub const AUTH_FAILED: &str = "Authentication failed";
pub const AUTH_ERROR_PREFIX: &str = "Authentication error: ";
pub const SESSION_EXPIRED: &str = "Session expired";
pub const ACCESS_DENIED: &str = "Access denied: Insufficient permissions";
pub const QUERY_ERROR_PREFIX: &str = "Query execution error: ";

/// Serve one accepted connection until it ends, then close it exactly once.
pub async fn serve_connection<S>(mut stream: S, state: Arc<GatewayState>, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut ctx = ConnContext::new(peer);
    debug!(target: "conn", "client={} peer={} connected", ctx.client_id, ctx.peer);
    match run_command_loop(&mut stream, &state, &mut ctx).await {
        Ok(()) => debug!(target: "conn", "client={} peer={} session ended", ctx.client_id, ctx.peer),
        Err(e) => error!(target: "conn", "client={} peer={} error handling connection: {}", ctx.client_id, ctx.peer, e),
    }
    if let Err(e) = stream.shutdown().await {
        debug!(target: "conn", "client={} error closing connection: {}", ctx.client_id, e);
    }
}

async fn run_command_loop<S>(stream: &mut S, state: &GatewayState, ctx: &mut ConnContext) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let command = match read_frame(stream).await {
            Ok(c) => c,
            Err(FrameError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        match command.as_str() {
            CMD_AUTH => {
                let email = read_frame(stream).await?;
                let password = read_frame(stream).await?;
                let (reply, event) = process_auth(state, ctx, &email, &password).await;
                respond(stream, state, reply, event).await?;
            }
            CMD_QUERY => {
                let session_id = read_frame(stream).await?;
                let query = read_frame(stream).await?;
                let (reply, event) = process_query(state, ctx, &session_id, &query).await;
                respond(stream, state, reply, event).await?;
            }
            CMD_EXIT => {
                debug!(target: "conn", "client={} sent EXIT", ctx.client_id);
                return Ok(());
            }
            other => {
                warn!(target: "conn", "client={} unknown command '{}' ignored", ctx.client_id, other.chars().take(32).collect::<String>());
            }
        }
    }
}

/// Send the reply, then hand the event to the audit sink whether or not the write succeeded.
async fn respond<S>(stream: &mut S, state: &GatewayState, reply: String, event: AuditEvent) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    let sent = write_frame(stream, &reply).await;
    state.audit.record(event);
    sent
}

/// Authenticate and, on a match, mint and register a new session.
pub async fn process_auth(state: &GatewayState, ctx: &mut ConnContext, email: &str, password: &str) -> (String, AuditEvent) {
    match state.validator.authenticate(email, password).await {
        Ok(Some(label)) => {
            let Some(role) = state.catalog.get(&label) else {
                warn!(target: "conn", "client={} validator returned unknown role '{}' for {}", ctx.client_id, label, email);
                let reply = format!("{}unknown role '{}'", AUTH_ERROR_PREFIX, label);
                return (reply, AuditEvent::auth(&ctx.client_id, email, Verdict::AuthError).with_role(&label));
            };
            let session = match state.sessions.issue(email, role) {
                Ok(s) => s,
                Err(e) => {
                    error!(target: "conn", "client={} could not issue session for {}: {}", ctx.client_id, email, e);
                    let reply = format!("{}{}", AUTH_ERROR_PREFIX, e.message());
                    return (reply, AuditEvent::auth(&ctx.client_id, email, Verdict::AuthError).with_role(&label));
                }
            };
            ctx.current_role = Some(label.clone());
            ctx.session_id = Some(session.session_id().to_string());
            info!(target: "conn", "client={} authenticated {} as {}", ctx.client_id, email, label);
            let reply = format!("{}{}", AUTH_OK_PREFIX, session.session_id());
            let event = AuditEvent::auth(&ctx.client_id, email, Verdict::Authenticated)
                .with_session(session.session_id())
                .with_role(&label);
            (reply, event)
        }
        Ok(None) => {
            debug!(target: "conn", "client={} authentication failed for {}", ctx.client_id, email);
            (AUTH_FAILED.to_string(), AuditEvent::auth(&ctx.client_id, email, Verdict::Rejected))
        }
        Err(e) => {
            error!(target: "conn", "client={} authentication error: {}", ctx.client_id, e);
            let reply = format!("{}{}", AUTH_ERROR_PREFIX, e.message());
            (reply, AuditEvent::auth(&ctx.client_id, email, Verdict::AuthError))
        }
    }
}

/// Check the session, gate the query, and only then execute it.
pub async fn process_query(state: &GatewayState, ctx: &mut ConnContext, session_id: &str, query: &str) -> (String, AuditEvent) {
    let (reply, event) = gate_and_execute(state, ctx, session_id, query).await;
    ctx.last_result = Some(reply.clone());
    (reply, event)
}

async fn gate_and_execute(state: &GatewayState, ctx: &ConnContext, session_id: &str, query: &str) -> (String, AuditEvent) {
    // The only expiry check for this request; once past it the query is not interrupted
    let Some(session) = state.sessions.lookup_live(session_id) else {
        debug!(target: "conn", "client={} query on unknown or expired session", ctx.client_id);
        return (SESSION_EXPIRED.to_string(), AuditEvent::query(&ctx.client_id, session_id, query, Verdict::SessionExpired));
    };
    let principal = session.user_id();
    let decision = check_query_allowed(&session.active_roles(), query);
    if !decision.permitted {
        info!(
            target: "conn",
            "client={} denied {} on {} for {}",
            ctx.client_id, decision.target.operation, decision.target.object, principal
        );
        let event = AuditEvent::query(&ctx.client_id, session_id, query, Verdict::Denied).with_principal(principal);
        return (ACCESS_DENIED.to_string(), event);
    }
    match state.executor.execute(query).await {
        Ok(output) => {
            let reply = output.to_reply();
            // A reply must fit in one frame
            if reply.len() > MAX_FRAME_LEN {
                warn!(target: "conn", "client={} result of {} bytes exceeds frame limit", ctx.client_id, reply.len());
                let event = AuditEvent::query(&ctx.client_id, session_id, query, Verdict::ExecError).with_principal(principal);
                return (format!("{}result exceeds {} bytes", QUERY_ERROR_PREFIX, MAX_FRAME_LEN), event);
            }
            let event = AuditEvent::query(&ctx.client_id, session_id, query, Verdict::Executed).with_principal(principal);
            (reply, event)
        }
        Err(e) => {
            error!(target: "conn", "client={} query execution error: {}", ctx.client_id, e);
            let event = AuditEvent::query(&ctx.client_id, session_id, query, Verdict::ExecError).with_principal(principal);
            (format!("{}{}", QUERY_ERROR_PREFIX, e.message()), event)
        }
    }
}
