//! Self-contained demo: emit keyed messages and consume them back.
//!
//! Runs the whole pipeline in-process against the in-memory store. The
//! demo plays the rebalancer itself: every partition goes to the single
//! consumer group instance, whose registration it acknowledges.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Args;
use keystream::{
    HandlerError, MessageHandler, OwnershipRecords, StreamError, StreamOptions, StreamStore,
};
use keystream_store::MemoryStore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigLoader, DemoConfig};

/// How long the demo waits for the next message before giving up
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Demo arguments
#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Number of messages to emit
    #[arg(long)]
    pub messages: Option<usize>,

    /// Number of distinct partition keys
    #[arg(long)]
    pub keys: Option<usize>,

    /// Partition count of the demo stream
    #[arg(long)]
    pub partitions: Option<u32>,
}

/// Payload emitted by the demo producer
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DemoEvent {
    key: String,
    seq: u64,
    emitted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Received {
    event: DemoEvent,
    received_at: DateTime<Utc>,
}

/// Decodes payloads and hands them to the verifier
struct DemoHandler {
    events: mpsc::UnboundedSender<Received>,
}

#[async_trait]
impl MessageHandler for DemoHandler {
    async fn on_message(&self, message: &[u8]) -> Result<(), HandlerError> {
        let event: DemoEvent = serde_json::from_slice(message)?;
        self.events.send(Received {
            event,
            received_at: Utc::now(),
        })?;
        Ok(())
    }

    fn on_error(&self, error: &StreamError) {
        warn!(error = %error, "Demo consumer error");
    }
}

/// Run demo command
pub async fn run(args: DemoArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let demo = DemoConfig {
        messages: args.messages.unwrap_or(config.demo.messages),
        keys: args.keys.unwrap_or(config.demo.keys),
        ..config.demo.clone()
    };
    if demo.keys == 0 {
        bail!("--keys must be at least 1");
    }

    let mut options = StreamOptions::default();
    if let Some(partitions) = args.partitions {
        options = options.with_partitions(partitions);
    }

    let store = Arc::new(MemoryStore::with_config(config.store.clone()));
    let stream = StreamStore::new(store, &demo.namespace, config.stream.clone())
        .open(&demo.topic, options)
        .await
        .context("Failed to open demo stream")?;

    let mut group = stream.consumer_group(&demo.group);
    let instance_id = group.instance_id().to_string();
    let records = stream.ownership(&demo.group);
    records.assign_all(&instance_id).await?;

    let cancel = CancellationToken::new();
    if config.stream.group.await_registration_ack {
        tokio::spawn(acknowledge_when_registered(
            records.clone(),
            instance_id.clone(),
            cancel.clone(),
        ));
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let handler = Arc::new(DemoHandler { events: events_tx });
    let consumer = {
        let cancel = cancel.clone();
        tokio::spawn(async move { group.run(&cancel, &handler).await })
    };

    info!(
        topic = %demo.topic,
        partitions = stream.partition_count(),
        messages = demo.messages,
        keys = demo.keys,
        "Emitting demo messages"
    );
    let mut next_seq: HashMap<String, u64> = HashMap::new();
    for i in 0..demo.messages {
        let key = format!("key-{}", i % demo.keys);
        let seq = next_seq.entry(key.clone()).or_default();
        let event = DemoEvent {
            key: key.clone(),
            seq: *seq,
            emitted_at: Utc::now(),
        };
        *seq += 1;
        stream.emit(&key, &serde_json::to_vec(&event)?).await?;
    }

    let mut expected: HashMap<String, u64> = HashMap::new();
    let mut per_partition: BTreeMap<u32, usize> = BTreeMap::new();
    let mut out_of_order = 0usize;
    let mut total_latency = chrono::Duration::zero();

    for _ in 0..demo.messages {
        let received = tokio::time::timeout(RECEIVE_TIMEOUT, events.recv())
            .await
            .context("Timed out waiting for demo messages")?
            .context("Demo consumer stopped early")?;
        let event = received.event;

        let want = expected.entry(event.key.clone()).or_default();
        if event.seq != *want {
            warn!(key = %event.key, expected = *want, got = event.seq, "Out of order delivery");
            out_of_order += 1;
        }
        *want = event.seq + 1;

        *per_partition
            .entry(stream.partition_for(&event.key))
            .or_default() += 1;
        total_latency += received.received_at - event.emitted_at;
        debug!(key = %event.key, seq = event.seq, "Verified message");
    }

    cancel.cancel();
    consumer.await??;

    println!("Consumed {} messages from {}", demo.messages, demo.topic);
    println!();
    println!("  Partition  Messages");
    for (partition, count) in &per_partition {
        println!("  {:>9}  {:>8}", partition, count);
    }
    println!();
    if demo.messages > 0 {
        let average = total_latency / i32::try_from(demo.messages).unwrap_or(i32::MAX);
        println!("Average latency: {} µs", average.num_microseconds().unwrap_or(0));
    }

    if out_of_order > 0 {
        bail!("{} messages arrived out of order", out_of_order);
    }
    println!("Per-key order verified for {} keys", expected.len());
    Ok(())
}

/// Acknowledge the instance's registration once its membership record shows up
async fn acknowledge_when_registered(
    records: OwnershipRecords,
    instance_id: String,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        match records.members().await {
            Ok(members) if members.iter().any(|m| m.instance_id == instance_id) => {
                if let Err(error) = records.acknowledge(&instance_id).await {
                    warn!(error = %error, "Failed to acknowledge demo consumer");
                }
                return;
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "Failed to list group members"),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
