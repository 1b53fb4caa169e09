/*
 * @file error.rs
 * @brief Error taxonomy for the async wire client core
 */

use thiserror::Error;

/// The five error kinds from the connection's error slot, plus `Format` for
/// request-local validation failures that never tear down the connection
/// (bad collection name, out-of-range count — see `codec::message`).
#[derive(Error, Debug)]
pub enum MongoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed connection while a reply was awaited")]
    Eof,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("out of memory")]
    Oom,

    #[error("{0}")]
    Other(String),

    #[error("malformed request: {0}")]
    Format(String),
}

impl MongoError {
    /// Stable numeric code, mirroring the connection's `err` field.
    pub fn code(&self) -> i32 {
        match self {
            MongoError::Io(_) => 1,
            MongoError::Eof => 2,
            MongoError::Protocol(_) => 3,
            MongoError::Oom => 4,
            MongoError::Other(_) => 5,
            MongoError::Format(_) => 6,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, MongoError>;
