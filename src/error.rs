//! Error taxonomy for the recall/indexing core (spec §7).
//!
//! Handlers never let these escape into the gateway: `before_agent_start`
//! always resolves to a context or `{}` (see `hooks::before_agent_start`).
//! Internally, `ErrConfig` and `ErrLocalStore` raised during startup are the
//! only variants allowed to fail fast; everything else is caught per search
//! path or per document and logged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecallError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("note store returned error {code}: {msg}")]
    Remote { code: i64, msg: String },

    #[error("transport error talking to note store: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response shape from note store: {0}")]
    Protocol(String),

    #[error("local index store failure: {0}")]
    LocalStore(#[from] rusqlite::Error),

    #[error("doc {0} not found")]
    NotFound(String),
}

impl From<serde_json::Error> for RecallError {
    fn from(e: serde_json::Error) -> Self {
        RecallError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecallError>;
