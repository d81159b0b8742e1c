//! Error types for the sync layer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no row with id '{id}' in {collection}")]
    NotFound { collection: String, id: String },

    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("row with id '{id}' already exists in {collection}")]
    Conflict { collection: String, id: String },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        SyncError::Invalid(msg.into())
    }

    /// True for errors that say "nothing there" rather than "something broke".
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
