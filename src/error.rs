use thiserror::Error;

use crate::anchor::AnchorError;

#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Unknown job status in store: {0}")]
    UnknownStatus(String),

    #[error("Merkle proof verification failed for job: {0}")]
    MerkleVerification(String),

    #[error("Anchor error: {0}")]
    Anchor(#[from] AnchorError),

    #[error("Keeper task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KeeperError>;
