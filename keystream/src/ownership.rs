//! Partition ownership and membership records of a consumer group.
//!
//! The consume loop only reads these records. Assigning partitions is the
//! job of an external rebalancer; [`OwnershipRecords`] gives such a
//! rebalancer (and tools and tests) typed access to the records without
//! deciding anything itself.

use std::sync::Arc;

use keystream_store::{Store, Transaction, decode_counter};
use tracing::info;

use crate::error::{Result, StreamError};
use crate::layout::TopicLayout;

/// Read the instance id recorded as owner of a partition.
pub(crate) async fn read_owner(
    tx: &mut dyn Transaction,
    owner_key: &[u8],
) -> keystream_store::Result<Option<String>> {
    Ok(tx
        .get(owner_key)
        .await?
        .map(|owner| String::from_utf8_lossy(&owner).into_owned()))
}

/// A registered consumer group instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub instance_id: String,
    /// Whether the rebalancer touched the record since registration.
    pub acknowledged: bool,
}

/// Handle on the ownership and membership records of one consumer group.
#[derive(Clone)]
pub struct OwnershipRecords {
    store: Arc<dyn Store>,
    layout: Arc<TopicLayout>,
    group_id: String,
    partition_count: u32,
}

impl OwnershipRecords {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        layout: Arc<TopicLayout>,
        group_id: &str,
        partition_count: u32,
    ) -> Self {
        Self {
            store,
            layout,
            group_id: group_id.to_string(),
            partition_count,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn check_partition(&self, partition: u32) -> Result<()> {
        if partition >= self.partition_count {
            return Err(StreamError::UnknownPartition {
                partition,
                partition_count: self.partition_count,
            });
        }
        Ok(())
    }

    /// Run `apply` in a transaction, retrying per the store's convention.
    async fn write(&self, apply: impl Fn(&mut dyn Transaction) + Send + Sync) -> Result<()> {
        let mut tx = self.store.begin().await?;
        loop {
            apply(tx.as_mut());
            match tx.commit().await {
                Ok(()) => return Ok(()),
                Err(error) => tx.on_error(error).await?,
            }
        }
    }

    /// Current owner of a partition.
    pub async fn owner(&self, partition: u32) -> Result<Option<String>> {
        self.check_partition(partition)?;
        let owner_key = self.layout.owner_key(&self.group_id, partition);
        let mut tx = self.store.begin().await?;
        loop {
            match read_owner(tx.as_mut(), &owner_key).await {
                Ok(owner) => return Ok(owner),
                Err(error) => tx.on_error(error).await?,
            }
        }
    }

    /// Record `instance_id` as the owner of a partition.
    pub async fn assign(&self, partition: u32, instance_id: &str) -> Result<()> {
        self.check_partition(partition)?;
        let owner_key = self.layout.owner_key(&self.group_id, partition);
        self.write(|tx| tx.set(&owner_key, instance_id.as_bytes()))
            .await?;
        info!(group = %self.group_id, partition, instance = %instance_id, "Assigned partition");
        Ok(())
    }

    /// Record `instance_id` as the owner of every partition.
    pub async fn assign_all(&self, instance_id: &str) -> Result<()> {
        let keys: Vec<_> = (0..self.partition_count)
            .map(|partition| self.layout.owner_key(&self.group_id, partition))
            .collect();
        self.write(|tx| {
            for key in &keys {
                tx.set(key, instance_id.as_bytes());
            }
        })
        .await?;
        info!(
            group = %self.group_id,
            partitions = self.partition_count,
            instance = %instance_id,
            "Assigned all partitions"
        );
        Ok(())
    }

    /// Remove the owner record of a partition.
    pub async fn release(&self, partition: u32) -> Result<()> {
        self.check_partition(partition)?;
        let owner_key = self.layout.owner_key(&self.group_id, partition);
        self.write(|tx| tx.clear(&owner_key)).await
    }

    /// Registered instances, in instance id order.
    pub async fn members(&self) -> Result<Vec<Member>> {
        let members = self.layout.members(&self.group_id);
        let (begin, end) = members.range();
        let mut tx = self.store.begin().await?;
        let pairs = loop {
            match tx.get_range(&begin, &end, usize::MAX).await {
                Ok(pairs) => break pairs,
                Err(error) => tx.on_error(error).await?,
            }
        };

        Ok(pairs
            .into_iter()
            .filter_map(|pair| {
                members.unpack_str(&pair.key).map(|instance_id| Member {
                    instance_id,
                    acknowledged: decode_counter(&pair.value) != 0,
                })
            })
            .collect())
    }

    /// Acknowledge a member's registration, releasing its registration wait.
    pub async fn acknowledge(&self, instance_id: &str) -> Result<()> {
        let member_key = self.layout.member_key(&self.group_id, instance_id);
        self.write(|tx| tx.atomic_add(&member_key, 1)).await?;
        info!(group = %self.group_id, instance = %instance_id, "Acknowledged member");
        Ok(())
    }

    /// Remove a member record.
    pub async fn remove_member(&self, instance_id: &str) -> Result<()> {
        let member_key = self.layout.member_key(&self.group_id, instance_id);
        self.write(|tx| tx.clear(&member_key)).await
    }
}
