use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API rate limit exceeded, retry after {retry_after:?} seconds")]
    RateLimit { retry_after: Option<u64> },

    #[error("API authentication error: {0}")]
    Auth(String),

    #[error("API client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("API server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HarvestError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Covers timeouts, connection failures, rate limiting and 5xx responses.
    /// Client errors, auth failures and open breakers are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            HarvestError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            HarvestError::RateLimit { .. } | HarvestError::Server { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
