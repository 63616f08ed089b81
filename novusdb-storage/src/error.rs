use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt meta page: {0}")]
    CorruptMeta(&'static str),

    #[error("corrupt record at page {page_id} slot {slot_offset}: {reason}")]
    CorruptRecord {
        page_id: u32,
        slot_offset: u16,
        reason: &'static str,
    },

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("lock held on {0}")]
    LockHeld(String),

    #[error("lock acquisition timed out on {0}")]
    LockTimeout(String),

    #[error("database is read-only")]
    ReadOnly,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("unknown index: {0}")]
    UnknownIndex(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("not-null violation on column {0}")]
    NotNullViolation(String),

    #[error("a transaction is already active")]
    TransactionActive,

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("wal corruption: {0}")]
    WalCorruption(String),
}
