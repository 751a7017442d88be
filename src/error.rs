use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScrapeError>;

/// Failure taxonomy shared by every portal client.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session expired")]
    SessionExpired,

    #[error("mfa challenge failed: {0}")]
    MfaFailed(String),

    #[error("network error: {0}")]
    Transient(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("could not decode payload: {0}")]
    Decode(String),

    #[error("missing markup: {0}")]
    Markup(String),

    #[error("invalid page request: page={page} page_size={page_size}")]
    InvalidPage { page: usize, page_size: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http client error: {0}")]
    Http(#[source] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("notification failed: {0}")]
    Notify(String),
}

impl ScrapeError {
    /// Errors worth another attempt, possibly through a different egress path.
    pub fn is_transient(&self) -> bool {
        match self {
            ScrapeError::Transient(_) | ScrapeError::Timeout => true,
            ScrapeError::Status { status, .. } => matches!(status, 502 | 503 | 504),
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ScrapeError::Auth(_) | ScrapeError::SessionExpired | ScrapeError::MfaFailed(_)
        )
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ScrapeError::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            ScrapeError::Transient(e)
        } else {
            ScrapeError::Http(e)
        }
    }
}

impl From<config::ConfigError> for ScrapeError {
    fn from(e: config::ConfigError) -> Self {
        ScrapeError::Config(e.to_string())
    }
}

impl From<url::ParseError> for ScrapeError {
    fn from(e: url::ParseError) -> Self {
        ScrapeError::Config(format!("bad url: {e}"))
    }
}
