use crate::store::StoreError;
use shared::board::BoardError;
use shared::ValidationError;

/// Failure of a run operation, on either the HTTP surface or the live channel.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    InsufficientPool(#[from] BoardError),
    #[error("persistence failed: {0}")]
    Persistence(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotFound(_) => SyncError::NotFound("Bingo run not found".to_string()),
            other => SyncError::Persistence(other),
        }
    }
}

impl SyncError {
    /// Message safe to hand back to a caller. Persistence details stay in the logs.
    pub fn public_message(&self, context: &str) -> String {
        match self {
            SyncError::Persistence(_) => context.to_string(),
            other => other.to_string(),
        }
    }
}
