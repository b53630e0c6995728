//! Relay error types.

use mqbridge_client::ClientError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("client: {0}")]
    Client(#[from] ClientError),

    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
