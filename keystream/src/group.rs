//! Consumer group instance: registration, partition discovery and the
//! consume loop.
//!
//! # Loop
//!
//! ```text
//! register ──► configure partitions ──► pass over owned consumers ──┐
//!                   ▲      │ none owned / store error               │
//!                   │      └──► backoff                             │
//!                   │                                               │
//!                   └─── ownership changed ◄────────────────────────┤
//!                                                                   │
//!                          all idle ──► wait for stream signal ◄────┘
//! ```
//!
//! Partitions are served one after another in a single task. Running more
//! instances of the same group, each owning a disjoint set of partitions, is
//! how consumption scales out.

use std::sync::Arc;

use keystream_store::{Store, Transaction, Watch, decode_counter, encode_counter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConsumerGroupConfig;
use crate::consumer::Consumer;
use crate::error::{Result, StreamError};
use crate::handler::MessageHandler;
use crate::layout::TopicLayout;
use crate::ownership::{OwnershipRecords, read_owner};

/// One instance of a consumer group.
pub struct ConsumerGroup {
    store: Arc<dyn Store>,
    layout: Arc<TopicLayout>,
    records: OwnershipRecords,
    instance_id: String,
    partition_count: u32,
    config: ConsumerGroupConfig,
    consumers: Vec<Consumer>,
}

impl ConsumerGroup {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        layout: Arc<TopicLayout>,
        records: OwnershipRecords,
        instance_id: &str,
        partition_count: u32,
        config: ConsumerGroupConfig,
    ) -> Self {
        Self {
            store,
            layout,
            records,
            instance_id: instance_id.to_string(),
            partition_count,
            config,
            consumers: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &str {
        self.records.group_id()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Partitions this instance currently consumes.
    pub fn owned_partitions(&self) -> Vec<u32> {
        self.consumers.iter().map(Consumer::partition).collect()
    }

    /// Write this instance's membership record so a rebalancer can see it.
    ///
    /// With `await_registration_ack` set, waits until the record is changed
    /// by someone else or `cancel` fires.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<()> {
        let member_key = self.layout.member_key(self.group_id(), &self.instance_id);

        let mut tx = self.store.begin().await?;
        let watch = loop {
            match announce(tx.as_mut(), &member_key).await {
                Ok(watch) => break watch,
                Err(error) => tx.on_error(error).await?,
            }
        };
        info!(group = %self.group_id(), instance = %self.instance_id, "Registered instance");

        if !self.config.await_registration_ack {
            return Ok(());
        }

        debug!(group = %self.group_id(), instance = %self.instance_id, "Waiting for acknowledgement");
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(group = %self.group_id(), "Registration wait cancelled");
            }
            result = watch.changed() => {
                result?;
                info!(group = %self.group_id(), instance = %self.instance_id, "Registration acknowledged");
            }
        }
        Ok(())
    }

    /// Rebuild the consumer set from the ownership records.
    ///
    /// Fails with [`StreamError::NoConsumersConfigured`] when this instance
    /// owns no partition; the consumer set is left empty in that case.
    pub async fn configure_partitions(&mut self) -> Result<()> {
        self.consumers.clear();

        let mut tx = self.store.begin().await?;
        let owned = loop {
            match self.read_owned_partitions(tx.as_mut()).await {
                Ok(owned) => break owned,
                Err(error) => tx.on_error(error).await?,
            }
        };

        if owned.is_empty() {
            return Err(StreamError::NoConsumersConfigured);
        }

        self.consumers = owned
            .iter()
            .map(|&partition| {
                Consumer::new(
                    Arc::clone(&self.store),
                    &self.layout,
                    self.group_id(),
                    &self.instance_id,
                    partition,
                )
            })
            .collect();
        info!(
            group = %self.group_id(),
            instance = %self.instance_id,
            partitions = ?owned,
            "Configured partitions"
        );
        Ok(())
    }

    async fn read_owned_partitions(
        &self,
        tx: &mut dyn Transaction,
    ) -> keystream_store::Result<Vec<u32>> {
        let mut owned = Vec::new();
        for partition in 0..self.partition_count {
            let owner_key = self.layout.owner_key(self.group_id(), partition);
            if read_owner(tx, &owner_key).await?.as_deref() == Some(self.instance_id.as_str()) {
                owned.push(partition);
            }
        }
        Ok(owned)
    }

    /// Register, then consume owned partitions until `cancel` fires.
    ///
    /// Handler failures and store errors met while consuming are passed to
    /// [`MessageHandler::on_error`] and the loop carries on. Only a failed
    /// registration is returned. On cancellation the membership record is
    /// removed and `Ok(())` is returned.
    pub async fn run<H: MessageHandler + ?Sized>(
        &mut self,
        cancel: &CancellationToken,
        handler: &H,
    ) -> Result<()> {
        self.register(cancel).await?;

        while !cancel.is_cancelled() {
            if self.consumers.is_empty() {
                match self.configure_partitions().await {
                    Ok(()) => {}
                    Err(StreamError::NoConsumersConfigured) => {
                        debug!(
                            group = %self.group_id(),
                            instance = %self.instance_id,
                            "No partitions owned, retrying after backoff"
                        );
                        self.backoff(cancel).await;
                        continue;
                    }
                    Err(error) => {
                        warn!(group = %self.group_id(), error = %error, "Partition discovery failed");
                        handler.on_error(&error);
                        self.backoff(cancel).await;
                        continue;
                    }
                }
            }

            let signal = match self.read_signal().await {
                Ok(signal) => signal,
                Err(error) => {
                    warn!(group = %self.group_id(), error = %error, "Failed to read stream signal");
                    handler.on_error(&error);
                    self.backoff(cancel).await;
                    continue;
                }
            };

            let all_idle = self.consume_pass(handler).await;

            if cancel.is_cancelled() {
                break;
            }

            if all_idle && let Err(error) = self.wait_for_signal(cancel, signal).await {
                warn!(group = %self.group_id(), error = %error, "Waiting for stream signal failed");
                handler.on_error(&error);
                self.backoff(cancel).await;
            }
        }

        self.deregister().await;
        info!(group = %self.group_id(), instance = %self.instance_id, "Consumer group stopped");
        Ok(())
    }

    /// One round-robin pass. Returns whether every consumer was idle.
    async fn consume_pass<H: MessageHandler + ?Sized>(&mut self, handler: &H) -> bool {
        let mut idle = 0;
        let mut ownership_lost = false;

        for consumer in &self.consumers {
            match consumer.consume(handler).await {
                Ok(()) => {}
                Err(StreamError::EndOfPartition) => idle += 1,
                Err(StreamError::OwnershipChanged { partition }) => {
                    info!(
                        group = %self.group_id(),
                        instance = %self.instance_id,
                        partition,
                        "Lost partition, rediscovering ownership"
                    );
                    ownership_lost = true;
                    break;
                }
                Err(error) => {
                    error!(
                        group = %self.group_id(),
                        partition = consumer.partition(),
                        error = %error,
                        "Consume failed"
                    );
                    handler.on_error(&error);
                }
            }
        }

        if ownership_lost {
            self.consumers.clear();
            return false;
        }
        idle == self.consumers.len()
    }

    async fn read_signal(&self) -> Result<i64> {
        let signal_key = self.layout.signal_key();
        let mut tx = self.store.begin().await?;
        let signal = loop {
            match tx.get(&signal_key).await {
                Ok(signal) => break signal,
                Err(error) => tx.on_error(error).await?,
            }
        };
        Ok(signal.map_or(0, |value| decode_counter(&value)))
    }

    /// Block until the stream signal differs from `observed`, the wait
    /// timeout elapses, or `cancel` fires.
    async fn wait_for_signal(&self, cancel: &CancellationToken, observed: i64) -> Result<()> {
        let signal_key = self.layout.signal_key();

        let mut tx = self.store.begin().await?;
        let watch = loop {
            match watch_unchanged_signal(tx.as_mut(), &signal_key, observed).await {
                Ok(watch) => break watch,
                Err(error) => tx.on_error(error).await?,
            }
        };
        let Some(watch) = watch else {
            trace!(group = %self.group_id(), "Stream signal moved during pass");
            return Ok(());
        };

        trace!(group = %self.group_id(), "All partitions idle, waiting for stream signal");
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = tokio::time::timeout(self.config.signal_wait_timeout, watch.changed()) => {
                match result {
                    Ok(changed) => changed?,
                    Err(_) => trace!(group = %self.group_id(), "Stream signal wait timed out"),
                }
            }
        }
        Ok(())
    }

    async fn backoff(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.reconfigure_backoff) => {}
        }
    }

    async fn deregister(&self) {
        if let Err(error) = self.records.remove_member(&self.instance_id).await {
            warn!(
                group = %self.group_id(),
                instance = %self.instance_id,
                error = %error,
                "Failed to remove membership record"
            );
        }
    }
}

/// Reset the membership record and watch it, in one transaction.
async fn announce(tx: &mut dyn Transaction, member_key: &[u8]) -> keystream_store::Result<Watch> {
    tx.set(member_key, &encode_counter(0));
    let watch = tx.watch(member_key).await?;
    tx.commit().await?;
    Ok(watch)
}

/// Watch the signal, or return `None` if it already moved past `observed`.
async fn watch_unchanged_signal(
    tx: &mut dyn Transaction,
    signal_key: &[u8],
    observed: i64,
) -> keystream_store::Result<Option<Watch>> {
    let current = tx
        .get(signal_key)
        .await?
        .map_or(0, |value| decode_counter(&value));
    if current != observed {
        return Ok(None);
    }

    let watch = tx.watch(signal_key).await?;
    tx.commit().await?;
    Ok(Some(watch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use keystream_store::MemoryStore;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use crate::error::HandlerError;
    use crate::test_utils::FaultyStore;
    use crate::{Stream, StreamConfig, StreamOptions, StreamStore};

    const GROUP: &str = "group";
    const WAIT: Duration = Duration::from_secs(2);

    struct Collector {
        messages: mpsc::UnboundedSender<Vec<u8>>,
        errors: mpsc::UnboundedSender<String>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn on_message(&self, message: &[u8]) -> std::result::Result<(), HandlerError> {
            let _ = self.messages.send(message.to_vec());
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err("rejected".into());
            }
            Ok(())
        }

        fn on_error(&self, error: &StreamError) {
            let _ = self.errors.send(error.to_string());
        }
    }

    struct Harness {
        stream: Stream,
        cancel: CancellationToken,
        messages: mpsc::UnboundedReceiver<Vec<u8>>,
        errors: mpsc::UnboundedReceiver<String>,
        collector: Arc<Collector>,
    }

    fn group_config(await_ack: bool) -> ConsumerGroupConfig {
        ConsumerGroupConfig::default()
            .with_reconfigure_backoff(Duration::from_millis(10))
            .with_signal_wait_timeout(Duration::from_secs(5))
            .with_await_registration_ack(await_ack)
    }

    async fn open(store: Arc<dyn Store>, partitions: u32, group: ConsumerGroupConfig) -> Stream {
        StreamStore::new(store, "test", StreamConfig::default().with_group(group))
            .open("topic", StreamOptions::default().with_partitions(partitions))
            .await
            .unwrap()
    }

    impl Harness {
        async fn new(partitions: u32, await_ack: bool) -> Self {
            let store = Arc::new(MemoryStore::new());
            Self::with_store(store, partitions, group_config(await_ack)).await
        }

        async fn with_store(
            store: Arc<dyn Store>,
            partitions: u32,
            group: ConsumerGroupConfig,
        ) -> Self {
            let stream = open(store, partitions, group).await;

            let (messages_tx, messages) = mpsc::unbounded_channel();
            let (errors_tx, errors) = mpsc::unbounded_channel();
            Self {
                stream,
                cancel: CancellationToken::new(),
                messages,
                errors,
                collector: Arc::new(Collector {
                    messages: messages_tx,
                    errors: errors_tx,
                    fail_next: AtomicBool::new(false),
                }),
            }
        }

        fn spawn(&self, instance_id: &str) -> JoinHandle<Result<()>> {
            let mut group = self.stream.consumer_group_with_id(GROUP, instance_id);
            let cancel = self.cancel.clone();
            let handler = Arc::clone(&self.collector);
            tokio::spawn(async move { group.run(&cancel, &handler).await })
        }

        async fn next_message(&mut self) -> Vec<u8> {
            tokio::time::timeout(WAIT, self.messages.recv())
                .await
                .expect("message should arrive")
                .unwrap()
        }

        async fn next_error(&mut self) -> String {
            tokio::time::timeout(WAIT, self.errors.recv())
                .await
                .expect("error should be reported")
                .unwrap()
        }

        async fn assert_no_message(&mut self) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(self.messages.try_recv().is_err());
        }

        /// A partition key routing to `partition`.
        fn key_for(&self, partition: u32) -> String {
            (0..)
                .map(|i| format!("key-{i}"))
                .find(|key| self.stream.partition_for(key) == partition)
                .unwrap()
        }

        async fn stop(&self, handle: JoinHandle<Result<()>>) {
            self.cancel.cancel();
            tokio::time::timeout(WAIT, handle)
                .await
                .expect("group should stop")
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn idle_group_wakes_on_emit_and_keeps_order() {
        let mut harness = Harness::new(4, false).await;
        harness.stream.ownership(GROUP).assign_all("a").await.unwrap();
        let handle = harness.spawn("a");
        harness.assert_no_message().await;

        for i in 0..5 {
            harness.stream.emit("k", format!("m{i}").as_bytes()).await.unwrap();
        }

        for i in 0..5 {
            assert_eq!(harness.next_message().await, format!("m{i}").into_bytes());
        }
        harness.stop(handle).await;
    }

    #[tokio::test]
    async fn serves_every_owned_partition() {
        let mut harness = Harness::new(2, false).await;
        harness.stream.ownership(GROUP).assign_all("a").await.unwrap();
        let (zero, one) = (harness.key_for(0), harness.key_for(1));
        harness.stream.emit(&zero, b"p0").await.unwrap();
        harness.stream.emit(&one, b"p1").await.unwrap();

        let handle = harness.spawn("a");
        let mut received = vec![harness.next_message().await, harness.next_message().await];
        received.sort();

        assert_eq!(received, vec![b"p0".to_vec(), b"p1".to_vec()]);
        harness.stop(handle).await;
    }

    #[tokio::test]
    async fn survives_owning_nothing_until_assigned() {
        let mut harness = Harness::new(2, false).await;
        harness.stream.emit("k", b"waiting").await.unwrap();
        let handle = harness.spawn("a");

        harness.assert_no_message().await;
        assert!(!handle.is_finished());
        let members = harness.stream.ownership(GROUP).members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].instance_id, "a");

        harness.stream.ownership(GROUP).assign_all("a").await.unwrap();
        assert_eq!(harness.next_message().await, b"waiting".to_vec());
        assert!(harness.errors.try_recv().is_err());
        harness.stop(handle).await;
    }

    #[tokio::test]
    async fn lost_partition_is_left_to_new_owner() {
        let mut harness = Harness::new(2, false).await;
        let records = harness.stream.ownership(GROUP);
        records.assign_all("a").await.unwrap();
        let (zero, one) = (harness.key_for(0), harness.key_for(1));
        let handle = harness.spawn("a");

        harness.stream.emit(&zero, b"first").await.unwrap();
        assert_eq!(harness.next_message().await, b"first".to_vec());
        harness.assert_no_message().await;

        records.assign(1, "b").await.unwrap();
        harness.stream.emit(&one, b"for b").await.unwrap();
        harness.stream.emit(&zero, b"second").await.unwrap();

        assert_eq!(harness.next_message().await, b"second".to_vec());
        harness.assert_no_message().await;
        harness.stop(handle).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (errors, _) = mpsc::unbounded_channel();
        let collector = Collector {
            messages: tx,
            errors,
            fail_next: AtomicBool::new(false),
        };
        let takeover = harness.stream.partition_consumer(GROUP, "b", 1).unwrap();
        takeover.consume(&collector).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"for b".to_vec());
    }

    #[tokio::test]
    async fn handler_error_is_reported_and_message_redelivered() {
        let mut harness = Harness::new(1, false).await;
        harness.stream.ownership(GROUP).assign_all("a").await.unwrap();
        harness.collector.fail_next.store(true, Ordering::SeqCst);
        let handle = harness.spawn("a");

        harness.stream.emit("k", b"flaky").await.unwrap();
        harness.stream.emit("k", b"next").await.unwrap();

        assert_eq!(harness.next_message().await, b"flaky".to_vec());
        assert_eq!(harness.next_message().await, b"flaky".to_vec());
        assert_eq!(harness.next_message().await, b"next".to_vec());
        let error = harness.errors.recv().await.unwrap();
        assert!(error.contains("rejected"));
        harness.stop(handle).await;
    }

    #[tokio::test]
    async fn consumption_waits_for_registration_ack() {
        let mut harness = Harness::new(1, true).await;
        let records = harness.stream.ownership(GROUP);
        records.assign_all("a").await.unwrap();
        harness.stream.emit("k", b"held").await.unwrap();
        let handle = harness.spawn("a");

        harness.assert_no_message().await;
        let members = records.members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(!members[0].acknowledged);

        records.acknowledge("a").await.unwrap();
        assert_eq!(harness.next_message().await, b"held".to_vec());
        harness.stop(handle).await;
    }

    #[tokio::test]
    async fn cancel_during_registration_wait_stops_cleanly() {
        let harness = Harness::new(1, true).await;
        let handle = harness.spawn("a");
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness.stop(handle).await;

        let members = harness.stream.ownership(GROUP).members().await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn configure_partitions_picks_owned_only() {
        let harness = Harness::new(4, false).await;
        let records = harness.stream.ownership(GROUP);
        let mut group = harness.stream.consumer_group_with_id(GROUP, "a");

        assert!(matches!(
            group.configure_partitions().await,
            Err(StreamError::NoConsumersConfigured)
        ));
        assert!(group.owned_partitions().is_empty());

        records.assign(1, "a").await.unwrap();
        records.assign(2, "b").await.unwrap();
        records.assign(3, "a").await.unwrap();
        group.configure_partitions().await.unwrap();

        assert_eq!(group.owned_partitions(), vec![1, 3]);
        assert_eq!(group.instance_id(), "a");
        assert_eq!(group.group_id(), GROUP);
    }

    #[tokio::test]
    async fn discovery_store_error_is_reported_and_loop_keeps_running() {
        let memory = MemoryStore::new();
        let faulty = FaultyStore::new(memory.clone());
        let mut harness =
            Harness::with_store(Arc::new(faulty.clone()), 1, group_config(false)).await;
        harness.stream.ownership(GROUP).assign_all("a").await.unwrap();

        faulty.fail_reads(true);
        let handle = harness.spawn("a");

        assert!(harness.next_error().await.contains("store closed"));
        // Backed off and tried again
        assert!(harness.next_error().await.contains("store closed"));
        assert!(!handle.is_finished());

        faulty.fail_reads(false);
        harness.stream.emit("k", b"after fault").await.unwrap();
        assert_eq!(harness.next_message().await, b"after fault".to_vec());
        harness.stop(handle).await;
    }

    #[tokio::test]
    async fn failed_cursor_commit_is_reported_and_cursor_kept() {
        let memory = MemoryStore::new();
        let faulty = FaultyStore::new(memory.clone());
        let mut harness =
            Harness::with_store(Arc::new(faulty.clone()), 1, group_config(false)).await;
        let producer = open(Arc::new(memory), 1, group_config(false)).await;
        producer.ownership(GROUP).assign_all("a").await.unwrap();
        let consumer = producer.partition_consumer(GROUP, "a", 0).unwrap();
        let handle = harness.spawn("a");
        harness.assert_no_message().await;

        faulty.fail_commits(true);
        producer.emit("k", b"stuck").await.unwrap();

        assert_eq!(harness.next_message().await, b"stuck".to_vec());
        assert!(harness.next_error().await.contains("store closed"));
        let cursor = consumer.cursor().await.unwrap();
        assert_eq!(cursor, producer.layout().message_prefix(0));

        faulty.fail_commits(false);
        producer.emit("k", b"next").await.unwrap();
        loop {
            let message = harness.next_message().await;
            if message == b"next" {
                break;
            }
            assert_eq!(message, b"stuck".to_vec());
        }
        let cursor = consumer.cursor().await.unwrap();
        assert_ne!(cursor, producer.layout().message_prefix(0));
        harness.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_wait_ends_after_signal_timeout() {
        let memory = MemoryStore::new();
        let group = group_config(false).with_signal_wait_timeout(Duration::from_secs(30));
        let mut harness = Harness::with_store(Arc::new(memory.clone()), 1, group).await;
        harness.stream.ownership(GROUP).assign_all("a").await.unwrap();
        let handle = harness.spawn("a");
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Appended without moving the stream signal
        let mut tx = memory.transaction().await;
        tx.set_versionstamped_key(&harness.stream.layout().message_prefix(0), b"quiet");
        tx.commit().await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(20), harness.messages.recv()).await;
        assert!(early.is_err(), "idle wait ended before its timeout");

        let late = tokio::time::timeout(Duration::from_secs(20), harness.messages.recv())
            .await
            .expect("next pass should follow the timeout")
            .unwrap();
        assert_eq!(late, b"quiet".to_vec());
        harness.stop(handle).await;
    }
}
