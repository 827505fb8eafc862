use thiserror::Error;

/// Every failure a pipeline stage can surface. Stages never swallow these;
/// the run halts and the CLI reports them.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API key rejected: {0}")]
    Auth(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CollectError {
    /// Transport failures, throttling and upstream 5xx are worth another try
    /// when retries are enabled. Key and payload problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            CollectError::Network(_) => true,
            CollectError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CollectError {
    fn from(e: reqwest::Error) -> Self {
        // The request URL carries the service key.
        CollectError::Network(e.without_url().to_string())
    }
}

impl From<quick_xml::Error> for CollectError {
    fn from(e: quick_xml::Error) -> Self {
        CollectError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for CollectError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            CollectError::Io(e.into())
        } else {
            CollectError::Parse(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectError>;
