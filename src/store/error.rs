use ulid::Ulid;

use crate::model::InvalidRecord;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Foreign-key violation: the spot was never registered.
    #[error("unknown spot: {0}")]
    UnknownSpot(Ulid),
    #[error("spot name already registered: {0}")]
    DuplicateSpotName(String),
    #[error("invalid history record: {0}")]
    InvalidRecord(#[from] InvalidRecord),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("corrupt WAL: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
