use thiserror::Error;

#[derive(Error, Debug)]
pub enum DonationError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Mail handoff failed: {0}")]
    Mail(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DonationError>;
