//! Gateway configuration.
//!
//! Every setting resolves as CLI flag, then environment variable, then default.
//! Malformed numbers are reported instead of silently falling back.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::identity::DEFAULT_SESSION_TTL;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
pub const DEFAULT_AUDIT_LOG: &str = "database_audit.log";
pub const DEFAULT_DATABASE_URL: &str = "host=127.0.0.1 port=5432 user=root dbname=piattaforma_streaming_musicale";

pub const USAGE: &str = "querygate\n\nUSAGE:\n  querygate [OPTIONS]\n\nOPTIONS:\n  --host ADDR               Bind address (env: QUERYGATE_HOST, default 0.0.0.0)\n  --port N                  Listening port (env: QUERYGATE_PORT, default 8080)\n  --session-ttl SECS        Session inactivity window (env: QUERYGATE_SESSION_TTL_SECS, default 300)\n  --max-connections N       Concurrent connection ceiling (env: QUERYGATE_MAX_CONNECTIONS, default 1024)\n  --shutdown-grace SECS     Wait for in-flight connections on shutdown (env: QUERYGATE_SHUTDOWN_GRACE_SECS, default 60)\n  --reaper-interval SECS    Purge expired sessions every SECS; 0 disables (env: QUERYGATE_REAPER_INTERVAL_SECS, default 0)\n  --audit-log PATH|off      Audit log file (env: QUERYGATE_AUDIT_LOG, default database_audit.log)\n  --database-url CONNSTR    Backing store connection string (env: QUERYGATE_DATABASE_URL)\n                            User/password overrides: QUERYGATE_DATABASE_USER, QUERYGATE_DATABASE_PASSWORD\n  -h, --help                Print this help\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// libpq-style key/value string or postgres:// URL.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { url: DEFAULT_DATABASE_URL.to_string(), user: None, password: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub session_ttl: Duration,
    pub max_connections: usize,
    pub shutdown_grace: Duration,
    /// `None` keeps expired sessions resident (no reaper).
    pub reaper_interval: Option<Duration>,
    /// `None` routes audit events to the log instead of a file.
    pub audit_log: Option<PathBuf>,
    pub store: StoreConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            session_ttl: DEFAULT_SESSION_TTL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            reaper_interval: None,
            audit_log: Some(PathBuf::from(DEFAULT_AUDIT_LOG)),
            store: StoreConfig::default(),
        }
    }
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

fn parse_num<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| anyhow!("invalid value '{}' for {}: {}", raw, name, e))
}

impl GatewayConfig {
    pub fn from_env_and_args(args: &[String]) -> Result<Self> {
        Self::resolve(args, |k| std::env::var(k).ok())
    }

    /// Resolve against explicit args and an environment lookup.
    pub fn resolve(args: &[String], env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |flag: &str, var: &str| arg_value(args, flag).or_else(|| env(var));
        let mut cfg = GatewayConfig::default();

        if let Some(v) = pick("--host", "QUERYGATE_HOST") { cfg.host = v; }
        if let Some(v) = pick("--port", "QUERYGATE_PORT") { cfg.port = parse_num("port", &v)?; }
        if let Some(v) = pick("--session-ttl", "QUERYGATE_SESSION_TTL_SECS") {
            cfg.session_ttl = Duration::from_secs(parse_num("session ttl", &v)?);
        }
        if let Some(v) = pick("--max-connections", "QUERYGATE_MAX_CONNECTIONS") {
            cfg.max_connections = parse_num("max connections", &v)?;
            if cfg.max_connections == 0 { bail!("max connections must be at least 1"); }
        }
        if let Some(v) = pick("--shutdown-grace", "QUERYGATE_SHUTDOWN_GRACE_SECS") {
            cfg.shutdown_grace = Duration::from_secs(parse_num("shutdown grace", &v)?);
        }
        if let Some(v) = pick("--reaper-interval", "QUERYGATE_REAPER_INTERVAL_SECS") {
            let secs: u64 = parse_num("reaper interval", &v)?;
            cfg.reaper_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = pick("--audit-log", "QUERYGATE_AUDIT_LOG") {
            let off = matches!(v.trim().to_lowercase().as_str(), "" | "off" | "none");
            cfg.audit_log = if off { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = pick("--database-url", "QUERYGATE_DATABASE_URL") { cfg.store.url = v; }
        cfg.store.user = env("QUERYGATE_DATABASE_USER");
        cfg.store.password = env("QUERYGATE_DATABASE_PASSWORD");
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
