//! Error types for stream operations.

/// Error returned by a [`MessageHandler`](crate::MessageHandler).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for stream operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// No message beyond the cursor right now.
    #[error("end of partition")]
    EndOfPartition,

    /// The partition is no longer owned by this consumer group instance.
    #[error("partition {partition} changed owner")]
    OwnershipChanged { partition: u32 },

    /// Partition discovery found nothing owned by this instance.
    #[error("no consumers configured")]
    NoConsumersConfigured,

    #[error("partition {partition} out of range for {partition_count} partitions")]
    UnknownPartition { partition: u32, partition_count: u32 },

    #[error("invalid partition count: {0}")]
    InvalidPartitionCount(u32),

    #[error("message handler failed: {0}")]
    Handler(#[source] HandlerError),

    #[error("store error: {0}")]
    Store(#[from] keystream_store::Error),
}

/// Result type alias for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
