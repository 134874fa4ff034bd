use thiserror::Error;

/// Errors talking to a running supervisor.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with a non-2xx status. `message` is its `error`
    /// field when the body has one, the raw body otherwise.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
