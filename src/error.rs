//! Unified application error model and mapping helpers.
//! `AppError` is the typed error at the collaborator seams (credential validation,
//! query execution, backing store). Its `message()` is what the connection handler
//! embeds in `Authentication error: ...` and `Query execution error: ...` replies.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    DataAccess { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::DataAccess { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::DataAccess { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn data_access<S: Into<String>>(code: S, msg: S) -> Self { AppError::DataAccess { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: treat as a data-access failure unless classified elsewhere
        AppError::DataAccess { code: "data_access".into(), message: err.to_string() }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io { code: "io".into(), message: err.to_string() }
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(err: tokio_postgres::Error) -> Self {
        // Prefer the server-side message (e.g. "relation \"x\" does not exist") when present
        let message = match err.as_db_error() {
            Some(db) => db.message().to_string(),
            None => err.to_string(),
        };
        AppError::DataAccess { code: "sql_error".into(), message }
    }
}
