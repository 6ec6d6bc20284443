//! Error types for teleflux

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Unexpected response [{status}]: {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error came from a request timeout or a failed connection,
    /// the two transport failures that warrant a retry.
    pub fn is_transient_transport(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
