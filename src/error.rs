use thiserror::Error;

/// Errors raised while reading or parsing an MxPEG byte stream.
#[derive(Debug, Error)]
pub enum MxpegError {
    #[error("parse error")]
    Parse,

    #[error("read error: {0}")]
    Read(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("buffer overflow")]
    Overflow,

    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MxpegResult<T> = Result<T, MxpegError>;
