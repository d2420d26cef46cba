use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt {table} row {id}: {reason}")]
    Corrupt {
        table: &'static str,
        id: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("game {0} not found")]
    MissingGame(String),

    #[error("game {0} has no final score")]
    Unscored(String),

    /// Only produced by the in-memory store when a test arms a failure.
    #[error("injected write failure for {0}")]
    Injected(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by {source_name} after {attempts} attempts")]
    RateLimited { source_name: String, attempts: u32 },

    #[error("{source_name} returned HTTP {status}: {body}")]
    Status {
        source_name: String,
        status: u16,
        body: String,
    },

    /// `error` has its URL stripped; query strings carry API keys.
    #[error("request to {source_name} failed: {error}")]
    Transport { source_name: String, error: reqwest::Error },

    #[error("could not decode {source_name} response: {reason}")]
    Decode { source_name: String, reason: String },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::RateLimited { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::Transport { error, .. } => error.is_timeout() || error.is_connect(),
            FetchError::Decode { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is not set")]
    Missing { key: &'static str },

    #[error("{key}={value} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
