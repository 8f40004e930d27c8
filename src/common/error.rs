use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no buffer frame available")]
    BufferNotFound,

    #[error("log space exhausted: {0}")]
    LogExhausted(String),

    #[error("row locked by transaction {holder}")]
    LockConflict { holder: u64 },

    #[error("serialization conflict")]
    SerializationConflict,

    #[error("unique constraint violated")]
    UniqueConstraint,

    #[error("transaction cancelled")]
    TransactionCancelled,

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("redo failed: {0}")]
    Redo(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),
}
