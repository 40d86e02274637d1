//! Error types for Backhaul.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid headers: {0}")]
    InvalidHeaders(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
