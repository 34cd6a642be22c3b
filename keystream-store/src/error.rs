//! Error types for store operations.

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Another transaction modified data this transaction read.
    #[error("transaction conflict")]
    Conflict,

    /// The transaction outlived the store's transaction timeout.
    #[error("transaction timed out")]
    TimedOut,

    #[error("value of {size} bytes exceeds the limit of {limit} bytes")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("key of {size} bytes exceeds the limit of {limit} bytes")]
    KeyTooLarge { size: usize, limit: usize },

    /// The transaction was used after a successful commit.
    #[error("transaction already committed")]
    AlreadyCommitted,

    /// The transaction owning the watch was dropped without committing.
    #[error("watch cancelled")]
    WatchCancelled,

    /// More versionstamped writes than a single commit can order.
    #[error("more than {limit} versionstamped writes in one transaction")]
    TooManyVersionstamps { limit: usize },

    #[error("retry limit reached after {attempts} attempts")]
    RetryLimitReached { attempts: u32 },

    #[error("store closed")]
    Closed,
}

impl Error {
    /// Whether the transaction may succeed if it is reset and run again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict | Error::TimedOut)
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
