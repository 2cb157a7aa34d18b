use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatVaultError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Store handle closed: {0}")]
    Closed(String),

    #[error("Write conflict on key: {0}")]
    WriteConflict(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[cfg(feature = "sync")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
