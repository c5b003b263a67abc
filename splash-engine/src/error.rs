use crate::model::RecordId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `splash-engine`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum SplashError {
    #[error("feed error: {0}")]
    Feed(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("splash record with id {0} not found")]
    RecordNotFound(RecordId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SplashError {
    /// Determine if an error is expected to clear on the next scheduled tick.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transient(&self) -> bool {
        match self {
            SplashError::Feed(_) | SplashError::Persistence(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SplashError {
    fn from(value: reqwest::Error) -> Self {
        Self::Feed(value.to_string())
    }
}

impl From<rusqlite::Error> for SplashError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for SplashError {
    fn from(value: serde_json::Error) -> Self {
        Self::Feed(format!("decode: {value}"))
    }
}
