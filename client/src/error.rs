use shared::ValidationError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("packet encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("real-time channel is closed")]
    ChannelClosed,
}
