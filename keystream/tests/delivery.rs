//! End-to-end delivery tests against the in-memory store.
//!
//! These cover the delivery contract seen from outside the crate:
//! - Messages of one partition key arrive in commit order
//! - Consumer groups keep independent, durable cursors
//! - A restarted instance resumes after the last consumed message

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keystream::{
    ConsumerGroupConfig, HandlerError, IdGenerator, MessageHandler, Stream, StreamConfig,
    StreamError, StreamOptions, StreamStore,
};
use keystream_store::{MemoryStore, Store};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Hands out the same instance id every time
struct FixedId(&'static str);

impl IdGenerator for FixedId {
    fn next_id(&self) -> String {
        self.0.to_string()
    }
}

/// Forwards every message to a channel
struct Forward(mpsc::UnboundedSender<Vec<u8>>);

#[async_trait]
impl MessageHandler for Forward {
    async fn on_message(&self, message: &[u8]) -> Result<(), HandlerError> {
        self.0.send(message.to_vec())?;
        Ok(())
    }

    fn on_error(&self, error: &StreamError) {
        panic!("unexpected consume error: {error}");
    }
}

fn config() -> StreamConfig {
    StreamConfig::default().with_group(
        ConsumerGroupConfig::default()
            .with_reconfigure_backoff(Duration::from_millis(10))
            .with_signal_wait_timeout(Duration::from_secs(1))
            .with_await_registration_ack(false),
    )
}

async fn open(store: &MemoryStore, instance_id: &'static str, partitions: u32) -> Stream {
    StreamStore::new(Arc::new(store.clone()), "it", config())
        .with_id_generator(Arc::new(FixedId(instance_id)))
        .open("events", StreamOptions::default().with_partitions(partitions))
        .await
        .unwrap()
}

fn spawn_consume(
    stream: &Stream,
    cancel: &CancellationToken,
    group_id: &'static str,
) -> (JoinHandle<keystream::Result<()>>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = stream.clone();
    let cancel = cancel.clone();
    let handle = tokio::spawn(async move { stream.consume(&cancel, group_id, &Forward(tx)).await });
    (handle, rx)
}

async fn receive(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, count: usize) -> Vec<String> {
    let mut received = Vec::with_capacity(count);
    while received.len() < count {
        let message = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for messages")
            .unwrap();
        received.push(String::from_utf8(message).unwrap());
    }
    received
}

async fn stop(cancel: &CancellationToken, handle: JoinHandle<keystream::Result<()>>) {
    cancel.cancel();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("consumer should stop")
        .unwrap()
        .unwrap();
}

/// Messages grouped by key, for payloads of the form `key:seq`.
fn by_key(messages: &[String]) -> HashMap<&str, Vec<u32>> {
    let mut grouped: HashMap<&str, Vec<u32>> = HashMap::new();
    for message in messages {
        let (key, seq) = message.split_once(':').unwrap();
        grouped.entry(key).or_default().push(seq.parse().unwrap());
    }
    grouped
}

#[tokio::test]
async fn single_message_is_consumed_exactly_once() {
    let store = MemoryStore::new();
    let stream = open(&store, "a", 8).await;
    let partition = stream.partition_for("k1");
    stream.ownership("g").assign(partition, "a").await.unwrap();
    let consumer = stream.partition_consumer("g", "a", partition).unwrap();

    stream.emit("k1", b"hello").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer.consume(&Forward(tx.clone())).await.unwrap();
    let second = consumer.consume(&Forward(tx)).await;

    assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
    assert!(matches!(second, Err(StreamError::EndOfPartition)));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn messages_arrive_in_commit_order() {
    let store = MemoryStore::new();
    let stream = open(&store, "a", 4).await;
    let partition = stream.partition_for("k");
    stream.ownership("g").assign(partition, "a").await.unwrap();

    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();
    stream.emit_on(first.as_mut(), "k", b"sent first");
    stream.emit_on(second.as_mut(), "k", b"sent second");
    second.commit().await.unwrap();
    first.commit().await.unwrap();

    let consumer = stream.partition_consumer("g", "a", partition).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer.consume(&Forward(tx.clone())).await.unwrap();
    consumer.consume(&Forward(tx)).await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), b"sent second".to_vec());
    assert_eq!(rx.recv().await.unwrap(), b"sent first".to_vec());
}

#[tokio::test]
async fn concurrent_producers_keep_per_key_order() {
    let store = MemoryStore::new();
    let stream = open(&store, "a", 4).await;
    stream.ownership("g").assign_all("a").await.unwrap();
    let cancel = CancellationToken::new();
    let (handle, mut rx) = spawn_consume(&stream, &cancel, "g");

    let producers: Vec<_> = ["alpha", "beta", "gamma", "delta", "epsilon"]
        .into_iter()
        .map(|key| {
            let stream = stream.clone();
            tokio::spawn(async move {
                for seq in 0..20 {
                    stream
                        .emit(key, format!("{key}:{seq}").as_bytes())
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let received = receive(&mut rx, 100).await;
    stop(&cancel, handle).await;

    let grouped = by_key(&received);
    assert_eq!(grouped.len(), 5);
    for sequence in grouped.values() {
        assert_eq!(*sequence, (0..20).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn groups_consume_independently() {
    let store = MemoryStore::new();
    let stream = open(&store, "a", 2).await;
    stream.ownership("audit").assign_all("a").await.unwrap();
    stream.ownership("billing").assign_all("a").await.unwrap();

    for seq in 0..3 {
        stream.emit("k", format!("k:{seq}").as_bytes()).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let (audit, mut audit_rx) = spawn_consume(&stream, &cancel, "audit");
    let (billing, mut billing_rx) = spawn_consume(&stream, &cancel, "billing");

    assert_eq!(receive(&mut audit_rx, 3).await, ["k:0", "k:1", "k:2"]);
    assert_eq!(receive(&mut billing_rx, 3).await, ["k:0", "k:1", "k:2"]);

    stop(&cancel, audit).await;
    stop(&cancel, billing).await;
}

#[tokio::test]
async fn restarted_instance_resumes_after_last_consumed() {
    let store = MemoryStore::new();
    let stream = open(&store, "a", 2).await;
    stream.ownership("g").assign_all("a").await.unwrap();
    stream.emit("k", b"k:0").await.unwrap();
    stream.emit("k", b"k:1").await.unwrap();

    let cancel = CancellationToken::new();
    let (handle, mut rx) = spawn_consume(&stream, &cancel, "g");
    assert_eq!(receive(&mut rx, 2).await, ["k:0", "k:1"]);
    stop(&cancel, handle).await;

    stream.emit("k", b"k:2").await.unwrap();

    let reopened = open(&store, "a", 2).await;
    let cancel = CancellationToken::new();
    let (handle, mut rx) = spawn_consume(&reopened, &cancel, "g");
    assert_eq!(receive(&mut rx, 1).await, ["k:2"]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    stop(&cancel, handle).await;
}

#[tokio::test]
async fn instances_split_partitions_between_them() {
    let store = MemoryStore::new();
    let first = open(&store, "first", 2).await;
    let second = open(&store, "second", 2).await;
    let records = first.ownership("g");
    records.assign(0, "first").await.unwrap();
    records.assign(1, "second").await.unwrap();

    let keys: Vec<String> = (0..10).map(|i| format!("key{i}")).collect();
    for key in &keys {
        first.emit(key, format!("{key}:0").as_bytes()).await.unwrap();
    }
    let on_zero = keys.iter().filter(|key| first.partition_for(key) == 0).count();

    let cancel = CancellationToken::new();
    let (first_handle, mut first_rx) = spawn_consume(&first, &cancel, "g");
    let (second_handle, mut second_rx) = spawn_consume(&second, &cancel, "g");

    let from_first = receive(&mut first_rx, on_zero).await;
    let from_second = receive(&mut second_rx, keys.len() - on_zero).await;

    assert!(from_first.iter().all(|m| first.partition_for(m.split_once(':').unwrap().0) == 0));
    assert!(from_second.iter().all(|m| first.partition_for(m.split_once(':').unwrap().0) == 1));

    stop(&cancel, first_handle).await;
    stop(&cancel, second_handle).await;
}
