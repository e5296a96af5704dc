//! Query execution against the backing store.
//!
//! The executor performs no authorization of its own: it is only reached after
//! the connection handler has checked the session and the RBAC gate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::SimpleQueryMessage;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::storage::BackingStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutput {
    /// Result set of a SELECT. `None` cells are SQL NULL.
    Table { columns: Vec<String>, rows: Vec<Vec<Option<String>>> },
    /// Row count reported for a mutation.
    RowsAffected(u64),
}

impl QueryOutput {
    /// Render the reply sent to the client: tab-terminated cells, one line per
    /// row after the header line, NULL as `null`; or `<N> rows affected`.
    pub fn to_reply(&self) -> String {
        match self {
            QueryOutput::Table { columns, rows } => {
                let mut out = String::new();
                for c in columns {
                    out.push_str(c);
                    out.push('\t');
                }
                out.push('\n');
                for row in rows {
                    for cell in row {
                        out.push_str(cell.as_deref().unwrap_or("null"));
                        out.push('\t');
                    }
                    out.push('\n');
                }
                out
            }
            QueryOutput::RowsAffected(n) => format!("{} rows affected", n),
        }
    }
}

/// Whether the executor should treat the statement as returning a result set.
pub fn is_select(query: &str) -> bool {
    query.trim().to_uppercase().starts_with("SELECT")
}

/// Number of non-empty statements in `query`, splitting on `;` outside string
/// literals, quoted identifiers, dollar-quoted bodies and comments.
pub fn statement_count(query: &str) -> usize {
    let b = query.as_bytes();
    let mut count = 0;
    let mut pending = false;
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b';' => {
                if pending { count += 1; }
                pending = false;
                i += 1;
                continue;
            }
            q @ (b'\'' | b'"') => {
                i += 1;
                while i < b.len() {
                    if b[i] == q {
                        // doubled quote is an escaped quote
                        if b.get(i + 1) == Some(&q) { i += 2; continue; }
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if b.get(i + 1) == Some(&b'-') => {
                while i < b.len() && b[i] != b'\n' { i += 1; }
                continue;
            }
            b'/' if b.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < b.len() && !(b[i] == b'*' && b.get(i + 1) == Some(&b'/')) { i += 1; }
                i += 2;
                continue;
            }
            b'$' => {
                let tag_end = b[i + 1..].iter().position(|c| !(c.is_ascii_alphanumeric() || *c == b'_')).map(|p| i + 1 + p);
                if let Some(end) = tag_end.filter(|e| b[*e] == b'$') {
                    let tag = &query[i..=end];
                    pending = true;
                    match query[end + 1..].find(tag) {
                        Some(close) => i = end + 1 + close + tag.len(),
                        None => i = b.len(),
                    }
                    continue;
                }
            }
            c if c.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            _ => {}
        }
        pending = true;
        i += 1;
    }
    if pending { count += 1; }
    count
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str) -> AppResult<QueryOutput>;
}

/// Runs raw query text on the backing store with the simple-query protocol.
pub struct SqlQueryExecutor {
    store: Arc<BackingStore>,
}

impl SqlQueryExecutor {
    pub fn new(store: Arc<BackingStore>) -> Self { Self { store } }
}

#[async_trait]
impl QueryExecutor for SqlQueryExecutor {
    async fn execute(&self, query: &str) -> AppResult<QueryOutput> {
        // The simple-query protocol runs every statement it is given; only the first was gated
        if statement_count(query) > 1 {
            return Err(AppError::data_access("multiple_statements", "multiple statements are not allowed"));
        }
        let client = self.store.client()?;
        let messages = client.simple_query(query).await?;
        let output = collect_output(is_select(query), messages);
        debug!(target: "exec", "executed query ({} chars)", query.len());
        Ok(output)
    }
}

fn collect_output(select: bool, messages: Vec<SimpleQueryMessage>) -> QueryOutput {
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<Option<String>>> = Vec::new();
    let mut affected: u64 = 0;
    for msg in messages {
        match msg {
            SimpleQueryMessage::RowDescription(cols) => {
                if columns.is_empty() {
                    columns = cols.iter().map(|c| c.name().to_string()).collect();
                }
            }
            SimpleQueryMessage::Row(row) => {
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                rows.push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
            }
            SimpleQueryMessage::CommandComplete(n) => affected = n,
            _ => {}
        }
    }
    if select { QueryOutput::Table { columns, rows } } else { QueryOutput::RowsAffected(affected) }
}
