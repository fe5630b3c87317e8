pub mod bits;

mod expand;
mod message;
mod tag;

pub use expand::*;
pub use message::*;
pub use tag::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DinoError {
    // The trailing "not found" and the exact "stale put" renderings are part
    // of the wire contract: broker clients map error text back to these
    // variants (see the remote versioned store).
    #[error("{0}: not found")]
    NotFound(String),
    #[error("stale put")]
    StalePut,
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("no data: {0}")]
    NoData(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("underflow: {0}")]
    Underflow(String),
    #[error("bad message: {0}")]
    BadMessage(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("request and response did not meet")]
    CancelledRendezvous,
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
}

impl DinoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DinoError::NotFound(_))
    }

    pub fn is_stale_put(&self) -> bool {
        matches!(self, DinoError::StalePut)
    }
}

pub type DinoResult<T> = std::result::Result<T, DinoError>;

impl From<std::io::Error> for DinoError {
    fn from(err: std::io::Error) -> Self {
        DinoError::IoError(err.to_string())
    }
}
