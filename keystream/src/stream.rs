//! Streams: partition routing and commit-ordered append.

use std::sync::Arc;

use keystream_store::{Store, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::config::StreamConfig;
use crate::consumer::Consumer;
use crate::error::{Result, StreamError};
use crate::group::ConsumerGroup;
use crate::handler::MessageHandler;
use crate::id::{IdGenerator, UuidV7Generator};
use crate::layout::TopicLayout;
use crate::ownership::OwnershipRecords;
use crate::partition::partition_for;

/// Per-stream options applied when a stream is opened.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    partition_count: Option<u32>,
}

impl StreamOptions {
    /// Partition count to use if the stream does not exist yet.
    #[must_use]
    pub fn with_partitions(mut self, count: u32) -> Self {
        self.partition_count = Some(count);
        self
    }
}

/// Entry point for opening streams under one namespace of a store.
#[derive(Clone)]
pub struct StreamStore {
    store: Arc<dyn Store>,
    namespace: String,
    config: StreamConfig,
    ids: Arc<dyn IdGenerator>,
}

impl StreamStore {
    pub fn new(store: Arc<dyn Store>, namespace: impl Into<String>, config: StreamConfig) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            config,
            ids: Arc::new(UuidV7Generator),
        }
    }

    /// Replace the generator used for consumer group instance ids.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Open the stream for `topic` with default options.
    pub async fn stream(&self, topic: &str) -> Result<Stream> {
        self.open(topic, StreamOptions::default()).await
    }

    /// Open the stream for `topic`, creating it if needed.
    ///
    /// The partition count is fixed by whichever call creates the stream;
    /// later opens use the stored count whatever they request.
    pub async fn open(&self, topic: &str, options: StreamOptions) -> Result<Stream> {
        let requested = options
            .partition_count
            .unwrap_or(self.config.partition_count);
        if requested == 0 {
            return Err(StreamError::InvalidPartitionCount(requested));
        }

        let layout = TopicLayout::new(&self.namespace, topic);
        let count_key = layout.partition_count_key();

        let mut tx = self.store.begin().await?;
        let partition_count = loop {
            match load_or_init_partition_count(tx.as_mut(), &count_key, requested).await {
                Ok(count) => break count,
                Err(error) => tx.on_error(error).await?,
            }
        };

        if partition_count != requested {
            warn!(
                topic,
                requested,
                partition_count,
                "Stream exists with a different partition count, using stored count"
            );
        }
        info!(namespace = %self.namespace, topic, partition_count, "Opened stream");

        Ok(Stream {
            store: Arc::clone(&self.store),
            layout: Arc::new(layout),
            partition_count,
            config: self.config.clone(),
            ids: Arc::clone(&self.ids),
        })
    }
}

async fn load_or_init_partition_count(
    tx: &mut dyn Transaction,
    count_key: &[u8],
    requested: u32,
) -> keystream_store::Result<u32> {
    let stored = tx
        .get(count_key)
        .await?
        .and_then(|value| <[u8; 4]>::try_from(value.as_slice()).ok())
        .map(u32::from_be_bytes);
    if let Some(count) = stored.filter(|count| *count > 0) {
        return Ok(count);
    }

    tx.set(count_key, &requested.to_be_bytes());
    tx.commit().await?;
    Ok(requested)
}

/// A partitioned, append-only message stream.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct Stream {
    store: Arc<dyn Store>,
    layout: Arc<TopicLayout>,
    partition_count: u32,
    config: StreamConfig,
    ids: Arc<dyn IdGenerator>,
}

impl Stream {
    pub fn topic(&self) -> &str {
        self.layout.topic()
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    /// Partition a partition key routes to.
    pub fn partition_for(&self, partition_key: &str) -> u32 {
        partition_for(partition_key, self.partition_count)
    }

    /// Append a message in its own transaction.
    ///
    /// Conflicts and timeouts are retried per the store's retry convention;
    /// other store errors are returned unchanged.
    pub async fn emit(&self, partition_key: &str, message: &[u8]) -> Result<()> {
        let mut tx = self.store.begin().await?;
        loop {
            self.emit_on(tx.as_mut(), partition_key, message);
            match tx.commit().await {
                Ok(()) => break,
                Err(error) => tx.on_error(error).await?,
            }
        }
        trace!(
            topic = self.topic(),
            partition = self.partition_for(partition_key),
            size = message.len(),
            "Emitted message"
        );
        Ok(())
    }

    /// Append a message inside a caller-owned transaction.
    ///
    /// Nothing is read, so the append adds no conflicts to `tx`. The message
    /// becomes visible when the caller commits; store errors such as an
    /// oversized payload surface from that commit, and retrying is up to the
    /// caller.
    pub fn emit_on(&self, tx: &mut dyn Transaction, partition_key: &str, message: &[u8]) {
        let partition = self.partition_for(partition_key);
        tx.set_versionstamped_key(&self.layout.message_prefix(partition), message);
        tx.atomic_add(&self.layout.signal_key(), 1);
    }

    /// Ownership and membership records of a consumer group.
    pub fn ownership(&self, group_id: &str) -> OwnershipRecords {
        OwnershipRecords::new(
            Arc::clone(&self.store),
            Arc::clone(&self.layout),
            group_id,
            self.partition_count,
        )
    }

    /// New consumer group instance with a generated instance id.
    pub fn consumer_group(&self, group_id: &str) -> ConsumerGroup {
        self.consumer_group_with_id(group_id, &self.ids.next_id())
    }

    /// New consumer group instance with a caller-chosen instance id.
    pub fn consumer_group_with_id(&self, group_id: &str, instance_id: &str) -> ConsumerGroup {
        ConsumerGroup::new(
            Arc::clone(&self.store),
            Arc::clone(&self.layout),
            self.ownership(group_id),
            instance_id,
            self.partition_count,
            self.config.group.clone(),
        )
    }

    /// Cursor over a single partition, outside of any consume loop.
    pub fn partition_consumer(
        &self,
        group_id: &str,
        instance_id: &str,
        partition: u32,
    ) -> Result<Consumer> {
        if partition >= self.partition_count {
            return Err(StreamError::UnknownPartition {
                partition,
                partition_count: self.partition_count,
            });
        }
        Ok(Consumer::new(
            Arc::clone(&self.store),
            &self.layout,
            group_id,
            instance_id,
            partition,
        ))
    }

    /// Consume the stream as a new instance of `group_id` until `cancel` fires.
    ///
    /// The instance resumes from the group's stored cursors on the partitions
    /// it is assigned.
    pub async fn consume<H: MessageHandler + ?Sized>(
        &self,
        cancel: &CancellationToken,
        group_id: &str,
        handler: &H,
    ) -> Result<()> {
        self.consumer_group(group_id).run(cancel, handler).await
    }
}
