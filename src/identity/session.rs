use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::tprintln;

use crate::error::{AppError, AppResult};
use crate::security::Role;

pub type SessionToken = String;

/// Produces fresh session tokens for a [`SessionStore`].
pub type IdSource = fn() -> AppResult<SessionToken>;

/// Default inactivity window before a session stops being usable.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// 256-bit random token, base64url without padding.
pub fn gen_id() -> AppResult<SessionToken> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf)
        .map_err(|e| AppError::internal("session_id", format!("session id generation failed: {}", e).as_str()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Token-bound principal with its active roles and a sliding expiry.
///
/// Fields are individually synchronized: no invariant spans user, roles and
/// timestamp together, so each is updated on its own.
#[derive(Debug)]
pub struct Session {
    session_id: SessionToken,
    user_id: String,
    active_roles: RwLock<Vec<Arc<Role>>>,
    last_access: Mutex<Instant>,
}

impl Session {
    pub fn with_id(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            active_roles: RwLock::new(Vec::new()),
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn session_id(&self) -> &str { &self.session_id }
    pub fn user_id(&self) -> &str { &self.user_id }

    /// Add a role to the active set. Roles are never removed; activating a role
    /// that is already active only refreshes the access time.
    pub fn activate(&self, role: Arc<Role>) {
        {
            let mut roles = self.active_roles.write();
            if !roles.iter().any(|r| r.name() == role.name()) {
                roles.push(role);
            }
        }
        self.touch();
    }

    pub fn active_roles(&self) -> Vec<Arc<Role>> {
        self.active_roles.read().clone()
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Move the access time to `at`; earlier instants are ignored.
    pub fn touch_at(&self, at: Instant) {
        let mut last = self.last_access.lock();
        if at > *last {
            *last = at;
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(Instant::now(), ttl)
    }

    /// Expired iff strictly more than `ttl` has elapsed since the last access.
    pub fn is_expired_at(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access()) > ttl
    }
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Concurrent registry of sessions keyed by token.
///
/// Owned by the server and shared with every connection through an `Arc`.
/// Expiry is evaluated lazily on lookup; expired records stay resident unless
/// `purge_expired` is called (see [`spawn_reaper`]).
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionToken, Arc<Session>>>,
    ttl: Duration,
    state: AtomicU8,
    mint: IdSource,
}

impl Default for SessionStore {
    fn default() -> Self { Self::new(DEFAULT_SESSION_TTL) }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_id_source(ttl, gen_id)
    }

    pub fn with_id_source(ttl: Duration, mint: IdSource) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), ttl, state: AtomicU8::new(STATE_CREATED), mint }
    }

    pub fn start(&self) {
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        info!(target: "session", "session store started (ttl_secs={})", self.ttl.as_secs_f64());
    }

    /// Drop every resident session and refuse further inserts. Returns the number dropped.
    pub fn stop(&self) -> usize {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        let dropped = {
            let mut m = self.sessions.write();
            let n = m.len();
            m.clear();
            n
        };
        info!(target: "session", "session store stopped, dropped {} session(s)", dropped);
        dropped
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPED
    }

    /// Create a session for `user_id`, activate `role` on it and register it.
    ///
    /// Fails if no token can be minted, if the minted token is already taken,
    /// or once the store is stopped. An existing session is never replaced.
    pub fn issue(&self, user_id: &str, role: Arc<Role>) -> AppResult<Arc<Session>> {
        let session = Arc::new(Session::with_id((self.mint)()?, user_id));
        session.activate(role);
        if !self.insert(session.clone()) {
            let reason = if self.is_stopped() { "session store is stopped" } else { "session id collision" };
            return Err(AppError::internal("session_issue", reason));
        }
        tprintln!("session.issue user={} sid={} ttl_secs={}", user_id, session.session_id(), self.ttl.as_secs());
        Ok(session)
    }

    /// Register a session. Returns false (and does nothing) once the store is
    /// stopped or when the token is already registered.
    pub fn insert(&self, session: Arc<Session>) -> bool {
        if self.is_stopped() {
            warn!(target: "session", "insert after stop ignored (user={})", session.user_id());
            return false;
        }
        let mut m = self.sessions.write();
        if m.contains_key(session.session_id()) {
            warn!(target: "session", "duplicate session id refused (user={})", session.user_id());
            return false;
        }
        m.insert(session.session_id.clone(), session);
        true
    }

    /// Raw lookup without expiry evaluation or access refresh.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Lookup used to serve a request: misses on unknown or expired sessions,
    /// otherwise refreshes the access time before returning.
    pub fn lookup_live(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.get(session_id)?;
        let now = Instant::now();
        if session.is_expired_at(now, self.ttl) {
            debug!(target: "session", "session for user={} expired", session.user_id());
            return None;
        }
        session.touch_at(now);
        Some(session)
    }

    pub fn len(&self) -> usize { self.sessions.read().len() }
    pub fn is_empty(&self) -> bool { self.sessions.read().is_empty() }

    /// Remove every session idle past the window. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut m = self.sessions.write();
        let before = m.len();
        m.retain(|_, s| !s.is_expired_at(now, self.ttl));
        before - m.len()
    }
}

/// Periodically purge expired sessions until `shutdown` flips to true.
/// Not started by default: lazy expiry without purge is the standard behaviour.
pub fn spawn_reaper(store: Arc<SessionStore>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(target: "session", "session reaper running every {:?}", every);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!(target: "session", "reaper purged {} expired session(s), {} resident", purged, store.len());
                    }
                }
                res = shutdown.wait_for(|stop| *stop) => {
                    if res.is_err() { debug!(target: "session", "reaper shutdown channel dropped"); }
                    break;
                }
            }
        }
        info!(target: "session", "session reaper stopped");
    })
}
