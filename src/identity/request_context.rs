/// Per-connection state. Never shared between connections.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub client_id: String,
    pub peer: String,
    /// Role label resolved by the last successful AUTH on this connection.
    pub current_role: Option<String>,
    /// Session minted by the last successful AUTH on this connection.
    pub session_id: Option<String>,
    /// Reply sent for the last QUERY.
    pub last_result: Option<String>,
}

impl ConnContext {
    pub fn new(peer: impl Into<String>) -> Self {
        let mut client_id = uuid::Uuid::new_v4().simple().to_string();
        client_id.truncate(8);
        Self { client_id, peer: peer.into(), current_role: None, session_id: None, last_result: None }
    }
}
