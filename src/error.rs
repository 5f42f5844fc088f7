//! # Error Taxonomy
//!
//! Every fallible operation in this crate returns [`Error`]. Callers match on
//! the variant, not on message text: the variant is the contract, the message
//! is diagnostic.
//!
//! Rough map:
//!
//! - Data lookups: [`Error::Absent`], [`Error::Multiple`]
//! - Streaming queries: [`Error::Finished`]
//! - Constraints: [`Error::Zero`], [`Error::Unique`], [`Error::Reference`]
//! - Schema declaration/evolution: [`Error::Type`], [`Error::Incompatible`]
//! - API misuse: [`Error::Param`]
//! - Storage integrity: [`Error::Store`]
//! - Primary key sequence exhaustion: [`Error::Seq`]
//! - Transaction state: [`Error::TxBotched`], [`Error::NotWritable`]
//! - Context: [`Error::Canceled`], [`Error::Timeout`]

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by database, transaction and query operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested record or key does not exist.
    #[error("absent: {0}")]
    Absent(String),

    /// A single-record get matched more than one record.
    #[error("multiple records matched: {0}")]
    Multiple(String),

    /// Streaming query is exhausted or was closed.
    #[error("query finished")]
    Finished,

    /// A `nonzero` field holds its kind's zero value.
    #[error("zero value: {0}")]
    Zero(String),

    /// Unique index collision on insert, update or index creation.
    #[error("unique constraint: {0}")]
    Unique(String),

    /// Referential integrity violation, or drop of a referenced type.
    #[error("reference: {0}")]
    Reference(String),

    /// Declared type is invalid, or types referencing each other were not
    /// registered together.
    #[error("type: {0}")]
    Type(String),

    /// A schema change is not a permitted widening.
    #[error("incompatible schema change: {0}")]
    Incompatible(String),

    /// Caller misuse: wrong value types, unknown fields, duplicate clauses,
    /// invalid query state.
    #[error("parameter: {0}")]
    Param(String),

    /// Underlying store or on-disk format integrity error.
    #[error("store: {0}")]
    Store(String),

    /// Integer primary key sequence exhausted for the field's width.
    #[error("sequence exhausted: {0}")]
    Seq(String),

    /// The transaction reached an inconsistent intermediate state; only
    /// rollback is meaningful.
    #[error("transaction botched")]
    TxBotched,

    /// Write operation attempted on a read-only transaction.
    #[error("transaction not writable")]
    NotWritable,

    /// The supplied context was canceled.
    #[error("canceled")]
    Canceled,

    /// A deadline passed: context deadline or open lock-acquisition timeout.
    #[error("timeout")]
    Timeout,

    /// Sentinel returned from a `for_each` closure to stop iteration early.
    /// Operations never return it to callers.
    #[error("stop")]
    StopForEach,
}

impl Error {
    pub(crate) fn store(msg: impl std::fmt::Display) -> Error {
        Error::Store(msg.to_string())
    }

    pub(crate) fn param(msg: impl Into<String>) -> Error {
        Error::Param(msg.into())
    }

    pub(crate) fn typ(msg: impl Into<String>) -> Error {
        Error::Type(msg.into())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Error {
        Error::store(e)
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Error {
        Error::store(e)
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Error {
        Error::store(e)
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Error {
        Error::store(e)
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Error {
        Error::store(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Store(format!("schema json: {e}"))
    }
}
