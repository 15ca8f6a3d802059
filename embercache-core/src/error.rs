use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the storage engine and promise coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("key not found")]
    KeyNotFound,

    #[error("delete key not found")]
    DeleteKeyNotFound,

    #[error("memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("key is too long")]
    KeyTooLong,

    #[error("key is too short")]
    KeyTooShort,

    #[error("value exceeds maximum size")]
    ObjectTooLarge,

    #[error("value is too short")]
    ValueTooShort,

    #[error("TTL must be greater than zero")]
    InvalidTtl,
}

/// Errors surfaced by the client when talking to cache hosts.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("key not found")]
    NotFound,

    #[error("promise conflict: another client is uploading")]
    Conflict { retry_after: Option<Duration> },

    #[error("no active promise for key")]
    NoPromise,

    #[error("content length does not match promised size")]
    SizeMismatch,

    #[error("insufficient storage capacity")]
    InsufficientStorage,

    #[error("payload exceeds maximum size")]
    PayloadTooLarge,

    #[error("content-length header required")]
    LengthRequired,

    #[error("bad request")]
    BadRequest,

    #[error("no cache hosts available")]
    NoHosts,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unexpected status: {0}")]
    UnexpectedStatus(u16),

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
