//! Crate-wide error type

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Store failure; aborts the whole run
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    /// Unknown cluster kind name
    #[error("{0}")]
    InvalidKind(String),
    #[error("invalid cluster id '{0}'")]
    InvalidClusterId(String),
    #[error("invalid flight {hash}: {reason}")]
    InvalidFlight { hash: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
