//! Error type for the query crate: storage errors pass through unchanged,
//! plus the statement-level error kinds the executor itself can raise.

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] novusdb_storage::Error),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("unknown index: {0}")]
    UnknownIndex(String),

    #[error("unknown sequence: {0}")]
    UnknownSequence(String),

    #[error("unknown view: {0}")]
    UnknownView(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("not-null violation: {0}")]
    NotNullViolation(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transaction already active")]
    TransactionActive,

    #[error("no active transaction")]
    NoActiveTransaction,
}
