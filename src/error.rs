//! Error taxonomy shared by the store, the engine and the remote boundary.

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// An external record is missing a structurally mandatory field.
    #[error("malformed {kind}: {reason}")]
    MalformedRecord { kind: &'static str, reason: String },

    /// A store write referenced a nonexistent track or broke a uniqueness rule.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Operator picked an index outside the candidate list.
    #[error("invalid selection {selection:?} for {available} candidates")]
    InvalidSelection {
        selection: Vec<usize>,
        available: usize,
    },

    #[error("remote api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("db error: {0}")]
    Db(rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Error::MalformedRecord {
            kind,
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref f, ref msg)
                if f.code == ErrorCode::ConstraintViolation =>
            {
                Error::ConstraintViolation(msg.clone().unwrap_or_else(|| f.to_string()))
            }
            other => Error::Db(other),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::malformed("response", e.to_string())
    }
}
