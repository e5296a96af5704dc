//! Identity, sessions and query gating.
//! Keep the public surface thin and split implementation across sub-modules.

mod session;
mod provider;
mod request_context;
mod authorizer;

pub use session::{gen_id, IdSource, Session, SessionToken, SessionStore, spawn_reaper, DEFAULT_SESSION_TTL};
pub use provider::{CredentialValidator, LocalCredentialValidator, SqlCredentialValidator, role_for_account_type};
pub use request_context::ConnContext;
pub use authorizer::{Decision, check_query_allowed};
