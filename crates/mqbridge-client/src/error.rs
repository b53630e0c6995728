//! Client error types.

use std::io;

use mqbridge_core::CoreError;
use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Operation attempted in the wrong client or connection state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Missing or contradictory configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A wait exceeded its deadline.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The broker or the MQTT library reported a failure.
    #[error("Rejected by broker: {0}")]
    BrokerRejected(String),

    /// A loan is outstanding on the receive queue.
    #[error("Read in progress: a loaned batch has not been returned")]
    ReadInProgress,

    /// `return_loan` called without an outstanding loan.
    #[error("No read in progress")]
    NoReadInProgress,

    /// Counters or callbacks disagree with the recorded request state.
    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<CoreError> for ClientError {
    fn from(e: CoreError) -> Self {
        ClientError::InvalidConfig(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
