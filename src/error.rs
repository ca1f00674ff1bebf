use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("no checkpoint satisfies the requested recovery point: {0}")]
    NoViableCheckpoint(String),

    #[error("single-writer conflict (bug signal): {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("engine is read-only: {0}")]
    ReadOnly(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Classify an `io::Error` raised while writing a durable file.
    /// ENOSPC escalates to `OutOfSpace` so the rpo controller can observe
    /// it and latch the engine read-only (spec §7's `OutOfSpace` row);
    /// anything else falls back to the generic `Io` variant.
    pub fn from_write_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            DbError::OutOfSpace(err.to_string())
        } else {
            DbError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
