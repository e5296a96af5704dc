//! Minimal async client for the gateway protocol.

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::server::handler::{AUTH_OK_PREFIX, SESSION_EXPIRED};
use crate::server::wire::{read_frame, write_frames, CMD_AUTH, CMD_EXIT, CMD_QUERY};

pub struct GatewayClient {
    stream: TcpStream,
    session_id: Option<String>,
}

impl GatewayClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("failed to connect to gateway")?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream, session_id: None })
    }

    /// Send AUTH and return the raw reply. A success reply replaces the remembered session.
    pub async fn authenticate(&mut self, email: &str, password: &str) -> Result<String> {
        let reply = self.round_trip(&[CMD_AUTH, email, password]).await?;
        if let Some(id) = session_from_reply(&reply) {
            self.session_id = Some(id);
        }
        Ok(reply)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Run a query on the remembered session. Without one, answers `Session expired` locally.
    pub async fn query(&mut self, sql: &str) -> Result<String> {
        match self.session_id.clone() {
            Some(sid) => self.query_with_session(&sid, sql).await,
            None => Ok(SESSION_EXPIRED.to_string()),
        }
    }

    pub async fn query_with_session(&mut self, session_id: &str, sql: &str) -> Result<String> {
        self.round_trip(&[CMD_QUERY, session_id, sql]).await
    }

    /// Send EXIT and close the write half.
    pub async fn close(mut self) -> Result<()> {
        write_frames(&mut self.stream, &[CMD_EXIT]).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn round_trip(&mut self, frames: &[&str]) -> Result<String> {
        write_frames(&mut self.stream, frames).await?;
        match read_frame(&mut self.stream).await {
            Ok(reply) => Ok(reply),
            Err(e) => bail!("gateway connection failed: {}", e),
        }
    }
}

/// Extract the session id from an `Authentication successful:<id>` reply.
pub fn session_from_reply(reply: &str) -> Option<String> {
    let id = reply.strip_prefix(AUTH_OK_PREFIX)?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_reply() {
        assert_eq!(session_from_reply("Authentication successful:abc_DEF-123").as_deref(), Some("abc_DEF-123"));
        assert_eq!(session_from_reply("Authentication failed"), None);
        assert_eq!(session_from_reply("Authentication successful:"), None);
        assert_eq!(session_from_reply("Authentication error: unknown role 'x'"), None);
    }
}
