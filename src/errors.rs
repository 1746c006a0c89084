use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("corrupted journal data: {0}")]
    Corruption(String),

    #[error("journal index is flagged to be skipped")]
    Skip,

    #[error("journal index must be rebuilt")]
    Rebuild,

    #[error("transient condition: {0}")]
    Transient(String),

    #[error("configuration: {0}")]
    Config(String),
}
