use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for environment and transaction operations
pub type Result<T> = result::Result<T, Error>;

/// Error conditions raised by the engine and the coordination layer
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Database file is corrupted
    #[error("Database file is corrupted")]
    Corrupted,
    /// Database version mismatch
    #[error("Database version mismatch")]
    VersionMismatch,
    /// File is not a valid data file
    #[error("File is not a valid data file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Map size was changed by another handle; adopt it before continuing
    #[error("Database contents grew beyond environment mapsize")]
    MapResized,
    /// Operation and DB incompatible
    #[error("Operation and DB incompatible")]
    Incompatible,
    /// Transaction must abort, or is in the wrong state for the call
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key or DB name
    #[error("Unsupported size of key/DB name/data")]
    BadValSize,
    /// The specified DBI was changed unexpectedly
    #[error("The specified DBI was changed unexpectedly")]
    BadDbi,
    /// Environment map size is invalid
    #[error("Invalid map size")]
    EnvInvalidMapSize,
    /// Transactions are active; the environment cannot be remapped
    #[error("Environment has active transactions")]
    EnvBusy,
    /// Transaction was already terminated
    #[error("Invalid transaction state")]
    TxnInvalid,
    /// Operation not allowed in a read-only transaction
    #[error("Transaction is read-only")]
    TxnReadOnly,
    /// Sentinel returned by a handler to re-run the whole transaction
    #[error("retry failed txn")]
    TxnRetry,
    /// Raw transactions cannot be started through a managed environment
    #[error("unmanaged transactions are not supported")]
    UnmanagedTxn,
    /// The worker owning a write transaction has exited
    #[error("attempted to use write transaction after it was closed")]
    WriteTxnClosed,
    /// I/O failure on the data file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Failure raised by a caller-supplied transaction function
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Build an application-level error for use inside transaction functions
    pub fn custom(msg: impl Into<String>) -> Self {
        Error::Custom(msg.into())
    }

    pub fn is_map_full(&self) -> bool {
        matches!(self, Error::MapFull)
    }

    pub fn is_map_resized(&self) -> bool {
        matches!(self, Error::MapResized)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// True for the handler retry sentinel
    pub fn is_retry(&self) -> bool {
        matches!(self, Error::TxnRetry)
    }
}
