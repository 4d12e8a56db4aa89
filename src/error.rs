use thiserror::Error;

/// Chat relay application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid listen address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
