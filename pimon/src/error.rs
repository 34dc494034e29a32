//! Error taxonomy for calls that cross the network boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("host answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("invalid address: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no target selected")]
    NotStarted,
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
