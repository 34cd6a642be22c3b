//! Single-partition cursor.
//!
//! A [`Consumer`] delivers the messages of one partition to a handler, one
//! at a time, on behalf of one consumer group instance. It never blocks
//! waiting for new messages and never retries a failed handler: both
//! policies belong to the [`ConsumerGroup`](crate::ConsumerGroup).

use std::sync::Arc;

use keystream_store::{Store, Transaction};
use tracing::{debug, trace};

use crate::error::{Result, StreamError};
use crate::handler::MessageHandler;
use crate::layout::TopicLayout;
use crate::ownership::read_owner;

/// Cursor over one partition for one consumer group instance.
pub struct Consumer {
    store: Arc<dyn Store>,
    group_id: String,
    instance_id: String,
    partition: u32,
    cursor_key: Vec<u8>,
    owner_key: Vec<u8>,
    initial_cursor: Vec<u8>,
    messages_end: Vec<u8>,
}

impl Consumer {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        layout: &TopicLayout,
        group_id: &str,
        instance_id: &str,
        partition: u32,
    ) -> Self {
        Self {
            store,
            group_id: group_id.to_string(),
            instance_id: instance_id.to_string(),
            partition,
            cursor_key: layout.cursor_key(group_id, partition),
            owner_key: layout.owner_key(group_id, partition),
            initial_cursor: layout.message_prefix(partition),
            messages_end: layout.messages_end(partition),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The stored cursor, or the partition's initial key if none is stored.
    pub async fn cursor(&self) -> Result<Vec<u8>> {
        let mut tx = self.store.begin().await?;
        loop {
            match self.load_cursor(tx.as_mut()).await {
                Ok(cursor) => return Ok(cursor),
                Err(error) => tx.on_error(error).await?,
            }
        }
    }

    /// Deliver the next message after the cursor to `handler` and advance
    /// the cursor past it.
    ///
    /// Returns [`StreamError::EndOfPartition`] straight away when there is
    /// nothing to consume, and [`StreamError::OwnershipChanged`] when the
    /// partition no longer belongs to this instance; in both cases the cursor
    /// is untouched. A handler error is returned as [`StreamError::Handler`]
    /// and the same message is delivered again on the next call.
    pub async fn consume<H: MessageHandler + ?Sized>(&self, handler: &H) -> Result<()> {
        let (key, message) = self.next_message().await?;
        trace!(
            group = %self.group_id,
            partition = self.partition,
            size = message.len(),
            "Delivering message"
        );

        handler
            .on_message(&message)
            .await
            .map_err(StreamError::Handler)?;

        self.commit_cursor(&key).await?;
        debug!(group = %self.group_id, partition = self.partition, "Advanced cursor");
        Ok(())
    }

    async fn load_cursor(&self, tx: &mut dyn Transaction) -> keystream_store::Result<Vec<u8>> {
        Ok(tx
            .get(&self.cursor_key)
            .await?
            .unwrap_or_else(|| self.initial_cursor.clone()))
    }

    async fn ensure_owner(&self, tx: &mut dyn Transaction) -> Result<()> {
        let owner = read_owner(tx, &self.owner_key).await?;
        if owner.as_deref() != Some(self.instance_id.as_str()) {
            debug!(
                group = %self.group_id,
                partition = self.partition,
                owner = ?owner,
                "Partition owned by another instance"
            );
            return Err(StreamError::OwnershipChanged {
                partition: self.partition,
            });
        }
        Ok(())
    }

    async fn next_message(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut tx = self.store.begin().await?;
        loop {
            match self.try_next_message(tx.as_mut()).await {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => return Err(StreamError::EndOfPartition),
                Err(StreamError::Store(error)) => tx.on_error(error).await?,
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_next_message(
        &self,
        tx: &mut dyn Transaction,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_owner(tx).await?;
        let cursor = self.load_cursor(tx).await?;

        let Some(key) = tx.first_key_after(&cursor, &self.messages_end).await? else {
            return Ok(None);
        };
        Ok(tx.get(&key).await?.map(|message| (key, message)))
    }

    async fn commit_cursor(&self, key: &[u8]) -> Result<()> {
        let mut tx = self.store.begin().await?;
        loop {
            match self.try_commit_cursor(tx.as_mut(), key).await {
                Ok(()) => return Ok(()),
                Err(StreamError::Store(error)) => tx.on_error(error).await?,
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_commit_cursor(&self, tx: &mut dyn Transaction, key: &[u8]) -> Result<()> {
        self.ensure_owner(tx).await?;

        let stored = tx.get(&self.cursor_key).await?;
        match stored {
            Some(stored) if stored.as_slice() >= key => {
                debug!(
                    group = %self.group_id,
                    partition = self.partition,
                    "Cursor already past message, keeping it"
                );
            }
            _ => tx.set(&self.cursor_key, key),
        }

        tx.commit().await?;
        Ok(())
    }
}
