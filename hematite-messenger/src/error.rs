//! Messenger error type

use std::io;

use thiserror::Error;

/// Errors surfaced by [`Messenger`](crate::Messenger) operations
#[derive(Debug, Error)]
pub enum Error {
    /// The address is malformed or lacks a host
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    /// The operation did not complete within the configured timeout
    #[error("Operation timed out")]
    Timeout,

    /// The operation requires a started messenger
    #[error("Messenger is not started")]
    Unstarted,

    /// IO error while creating a connector or listener
    #[error("IO Error: {0:?}")]
    Io(#[from] io::Error),

    /// Message encoding or decoding failed
    #[error("Codec Error: {0}")]
    Codec(#[from] serde_amqp::Error),
}
