//! Partitioned, ordered message streams on a transactional key-value store.
//!
//! Producers append to a stream under a partition key; every message with
//! the same key lands in the same partition, in commit order. Consumer
//! groups read the stream with durable per-partition cursors, at-least-once,
//! consuming only the partitions an external rebalancer assigned to them.
//!
//! # Key Types
//!
//! - [`StreamStore`] - Opens streams under a namespace of a [`Store`](keystream_store::Store)
//! - [`Stream`] - Emits messages and starts consumer groups
//! - [`ConsumerGroup`] - Consume loop of one group instance
//! - [`Consumer`] - Cursor over a single partition
//! - [`MessageHandler`] - Callbacks receiving messages and errors
//! - [`OwnershipRecords`] - Partition ownership and membership records
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keystream::{StreamConfig, StreamStore};
//! use keystream_store::MemoryStore;
//!
//! # async fn example() -> keystream::Result<()> {
//! let streams = StreamStore::new(Arc::new(MemoryStore::new()), "app", StreamConfig::default());
//! let orders = streams.stream("orders").await?;
//! orders.emit("customer-42", b"order placed").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod handler;
pub mod id;
pub mod layout;
pub mod ownership;
pub mod partition;
pub mod stream;

#[cfg(test)]
mod test_utils;

// Re-exports
pub use config::{ConsumerGroupConfig, StreamConfig};
pub use consumer::Consumer;
pub use error::{HandlerError, Result, StreamError};
pub use group::ConsumerGroup;
pub use handler::MessageHandler;
pub use id::{IdGenerator, UuidV7Generator};
pub use layout::{Element, Subspace, TopicLayout};
pub use ownership::{Member, OwnershipRecords};
pub use partition::{fnv1a32, partition_for};
pub use stream::{Stream, StreamOptions, StreamStore};
