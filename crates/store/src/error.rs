use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure reported by a remote API: transport errors carry no status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Client error from URL:{url}, error:{} - status:{}",
    .payload.as_deref().unwrap_or(""),
    status_text(.status)
)]
pub struct ClientError {
    pub url: String,
    pub payload: Option<String>,
    pub status: Option<u16>,
}

impl ClientError {
    pub fn new(url: impl Into<String>, payload: Option<String>, status: Option<u16>) -> Self {
        Self {
            url: url.into(),
            payload,
            status,
        }
    }
}

fn status_text(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Journey {0} not found")]
    JourneyNotFound(i64),

    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("Codec error: {0}")]
    Codec(#[from] waypoint_core::CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
