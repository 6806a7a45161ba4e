//! Error taxonomy for the dial/tunnel establishment pipeline.
//!
//! Six kinds, no more: configuration errors are fatal at load time and
//! never surfaced mid-dial; the rest are the only errors a dial attempt
//! can end in. The dialer never retries and the iterator never returns
//! an error for a single bad record — see the component modules for
//! where each kind is actually raised.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("untrusted peer: {0}")]
    Verification(String),

    #[error("canceled")]
    Canceled,

    #[error("storage: {0}")]
    Storage(String),
}

impl DialError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        DialError::Configuration(msg.into())
    }

    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        DialError::Handshake(msg.into())
    }

    pub fn verification<S: Into<String>>(msg: S) -> Self {
        DialError::Verification(msg.into())
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        DialError::Storage(msg.into())
    }
}

impl From<redb::Error> for DialError {
    fn from(e: redb::Error) -> Self {
        DialError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for DialError {
    fn from(e: redb::TransactionError) -> Self {
        DialError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for DialError {
    fn from(e: redb::TableError) -> Self {
        DialError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for DialError {
    fn from(e: redb::StorageError) -> Self {
        DialError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for DialError {
    fn from(e: redb::CommitError) -> Self {
        DialError::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for DialError {
    fn from(e: redb::DatabaseError) -> Self {
        DialError::Storage(e.to_string())
    }
}
