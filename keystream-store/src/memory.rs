//! In-memory Store implementation.
//!
//! Keeps the whole key space in a `BTreeMap` and provides serializable
//! transactions through optimistic concurrency control: every transaction
//! records the ranges it read and the commit is rejected with
//! [`Error::Conflict`] if any key in those ranges was modified by a
//! transaction that committed after this one started.
//!
//! Only the latest value of each key is kept, so a read that would observe a
//! commit newer than the transaction's read version fails with
//! [`Error::Conflict`] instead. Every successful read is therefore consistent
//! with the snapshot the transaction started from.
//!
//! Useful for testing and for single-process deployments. Nothing is
//! persisted.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::{decode_counter, encode_counter};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::traits::{KeyValue, Store, Transaction, VERSIONSTAMP_LEN, Versionstamp, Watch};

/// Committed data plus the bookkeeping needed for conflict detection.
struct State {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Commit version that last touched each key, cleared keys included.
    modified: BTreeMap<Vec<u8>, u64>,
    version: u64,
}

impl State {
    /// Whether any key in `[begin, end)` was modified after `version`.
    fn changed_since(&self, begin: &[u8], end: &[u8], version: u64) -> bool {
        self.modified
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .any(|(_, modified)| *modified > version)
    }
}

/// Most versionstamped writes one commit can order, one per batch order.
const MAX_VERSIONSTAMPS: usize = u16::MAX as usize + 1;

/// Shared state between the store and its transactions.
struct Shared {
    state: RwLock<State>,
    /// Publishes every new commit version so watches can re-check their key.
    commits: watch::Sender<u64>,
    config: StoreConfig,
}

/// In-memory implementation of [`Store`].
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create an empty store with the given limits and retry policy.
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        let (commits, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    data: BTreeMap::new(),
                    modified: BTreeMap::new(),
                    version: 0,
                }),
                commits,
                config,
            }),
        }
    }

    /// Start a transaction without boxing it.
    pub async fn transaction(&self) -> MemoryTransaction {
        let read_version = self.shared.state.read().await.version;
        MemoryTransaction {
            shared: Arc::clone(&self.shared),
            read_version,
            started: Instant::now(),
            reads: Vec::new(),
            seen: HashMap::new(),
            writes: Vec::new(),
            versionstamps: 0,
            watches: Vec::new(),
            rejected: None,
            committed: false,
            attempts: 0,
        }
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.shared.state.read().await.data.len()
    }

    /// Check if the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.shared.state.read().await.data.is_empty()
    }

    /// Latest commit version.
    pub async fn version(&self) -> u64 {
        self.shared.state.read().await.version
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(self.transaction().await))
    }
}

/// A buffered write, applied at commit.
enum Mutation {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    Add(Vec<u8>, i64),
    SetVersionstamped(Vec<u8>, Vec<u8>),
}

/// Transaction over a [`MemoryStore`].
///
/// Reads observe the transaction's own `set` and `clear` writes. Atomic adds
/// and versionstamped keys only become visible once committed.
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    read_version: u64,
    started: Instant,
    /// Read-conflict ranges, `[begin, end)`.
    reads: Vec<(Vec<u8>, Vec<u8>)>,
    /// Values returned by point reads, used as watch baselines.
    seen: HashMap<Vec<u8>, Option<Vec<u8>>>,
    writes: Vec<Mutation>,
    versionstamps: usize,
    /// Armed on commit; dropping them cancels the matching watches.
    watches: Vec<oneshot::Sender<()>>,
    /// First write that can never commit (limit violation, use after commit).
    rejected: Option<Error>,
    committed: bool,
    attempts: u32,
}

/// The key immediately following `key` in byte order.
fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.committed {
            return Err(Error::AlreadyCommitted);
        }
        Ok(())
    }

    fn reject(&mut self, error: Error) {
        if self.rejected.is_none() {
            self.rejected = Some(error);
        }
    }

    fn check_write(&mut self, key_len: usize, value_len: usize) {
        let config = &self.shared.config;
        let error = if self.committed {
            Some(Error::AlreadyCommitted)
        } else if key_len > config.max_key_size {
            Some(Error::KeyTooLarge {
                size: key_len,
                limit: config.max_key_size,
            })
        } else if value_len > config.max_value_size {
            Some(Error::ValueTooLarge {
                size: value_len,
                limit: config.max_value_size,
            })
        } else {
            None
        };

        if let Some(error) = error {
            self.reject(error);
        }
    }

    /// Latest buffered `set`/`clear` per key. `None` marks a cleared key.
    fn overlay(&self) -> BTreeMap<&[u8], Option<&[u8]>> {
        let mut overlay = BTreeMap::new();
        for mutation in &self.writes {
            match mutation {
                Mutation::Set(key, value) => {
                    overlay.insert(key.as_slice(), Some(value.as_slice()));
                }
                Mutation::Clear(key) => {
                    overlay.insert(key.as_slice(), None);
                }
                Mutation::Add(..) | Mutation::SetVersionstamped(..) => {}
            }
        }
        overlay
    }

    async fn reset(&mut self) {
        self.read_version = self.shared.state.read().await.version;
        self.started = Instant::now();
        self.reads.clear();
        self.seen.clear();
        self.writes.clear();
        self.versionstamps = 0;
        self.watches.clear();
        self.rejected = None;
        self.committed = false;
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.reads.push((key.to_vec(), key_after(key)));

        let buffered = self.overlay().get(key).map(|value| value.map(<[u8]>::to_vec));
        let value = match buffered {
            Some(value) => value,
            None => {
                let state = self.shared.state.read().await;
                if state.changed_since(key, &key_after(key), self.read_version) {
                    debug!(read_version = self.read_version, "Read past snapshot");
                    return Err(Error::Conflict);
                }
                state.data.get(key).cloned()
            }
        };

        self.seen.insert(key.to_vec(), value.clone());
        Ok(value)
    }

    async fn first_key_after(&mut self, after: &[u8], end: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        if after >= end {
            return Ok(None);
        }

        let begin = key_after(after);
        let (found, conflict_end, stale) = {
            let overlay = self.overlay();
            let bounds = (Bound::Excluded(after), Bound::Excluded(end));
            let state = self.shared.state.read().await;

            let stored = state
                .data
                .range::<[u8], _>(bounds)
                .map(|(key, _)| key)
                .find(|key| !matches!(overlay.get(key.as_slice()), Some(None)))
                .cloned();
            let local = overlay
                .range::<[u8], _>(bounds)
                .find(|(_, value)| value.is_some())
                .map(|(key, _)| key.to_vec());

            let found = match (stored, local) {
                (Some(stored), Some(local)) => Some(stored.min(local)),
                (stored, local) => stored.or(local),
            };
            let conflict_end = match &found {
                Some(key) => key_after(key),
                None => end.to_vec(),
            };
            let stale = state.changed_since(&begin, &conflict_end, self.read_version);
            (found, conflict_end, stale)
        };

        if stale {
            debug!(read_version = self.read_version, "Range read past snapshot");
            return Err(Error::Conflict);
        }
        self.reads.push((begin, conflict_end));
        Ok(found)
    }

    async fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        self.ensure_open()?;
        if begin >= end || limit == 0 {
            return Ok(Vec::new());
        }

        let (pairs, conflict_end, stale) = {
            let overlay = self.overlay();
            let bounds = (Bound::Included(begin), Bound::Excluded(end));
            let state = self.shared.state.read().await;
            let mut stored = state.data.range::<[u8], _>(bounds).peekable();
            let mut local = overlay.range::<[u8], _>(bounds).peekable();
            let mut pairs = Vec::new();

            while pairs.len() < limit {
                let stored_key = stored.peek().map(|&(key, _)| key.as_slice());
                let local_key = local.peek().map(|&(key, _)| *key);

                let take_local = match (stored_key, local_key) {
                    (None, None) => break,
                    (Some(_), None) => false,
                    (None, Some(_)) => true,
                    (Some(stored_key), Some(local_key)) => local_key <= stored_key,
                };

                if take_local {
                    let Some((key, value)) = local.next() else {
                        break;
                    };
                    if stored_key == Some(*key) {
                        stored.next();
                    }
                    if let Some(value) = value {
                        pairs.push(KeyValue {
                            key: key.to_vec(),
                            value: value.to_vec(),
                        });
                    }
                } else if let Some((key, value)) = stored.next() {
                    pairs.push(KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }

            let conflict_end = match pairs.last() {
                Some(last) if pairs.len() == limit => key_after(&last.key),
                _ => end.to_vec(),
            };
            let stale = state.changed_since(begin, &conflict_end, self.read_version);
            (pairs, conflict_end, stale)
        };

        if stale {
            debug!(read_version = self.read_version, "Range read past snapshot");
            return Err(Error::Conflict);
        }
        self.reads.push((begin.to_vec(), conflict_end));
        Ok(pairs)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.check_write(key.len(), value.len());
        self.writes.push(Mutation::Set(key.to_vec(), value.to_vec()));
    }

    fn clear(&mut self, key: &[u8]) {
        self.check_write(key.len(), 0);
        self.writes.push(Mutation::Clear(key.to_vec()));
    }

    fn atomic_add(&mut self, key: &[u8], delta: i64) {
        self.check_write(key.len(), 8);
        self.writes.push(Mutation::Add(key.to_vec(), delta));
    }

    fn set_versionstamped_key(&mut self, prefix: &[u8], value: &[u8]) {
        self.check_write(prefix.len() + VERSIONSTAMP_LEN, value.len());
        if self.versionstamps == MAX_VERSIONSTAMPS {
            self.reject(Error::TooManyVersionstamps {
                limit: MAX_VERSIONSTAMPS,
            });
            return;
        }
        self.versionstamps += 1;
        self.writes
            .push(Mutation::SetVersionstamped(prefix.to_vec(), value.to_vec()));
    }

    async fn watch(&mut self, key: &[u8]) -> Result<Watch> {
        self.ensure_open()?;

        let buffered = self.overlay().get(key).map(|value| value.map(<[u8]>::to_vec));
        let baseline = match buffered {
            Some(value) => value,
            None => match self.seen.get(key) {
                Some(value) => value.clone(),
                None => self.shared.state.read().await.data.get(key).cloned(),
            },
        };

        let (armed_tx, armed_rx) = oneshot::channel();
        self.watches.push(armed_tx);

        let shared = Arc::clone(&self.shared);
        let key = key.to_vec();
        Ok(Watch::new(async move {
            armed_rx.await.map_err(|_| Error::WatchCancelled)?;
            let mut commits = shared.commits.subscribe();
            loop {
                let current = shared.state.read().await.data.get(&key).cloned();
                if current != baseline {
                    return Ok(());
                }
                commits.changed().await.map_err(|_| Error::Closed)?;
            }
        }))
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(error) = self.rejected.clone() {
            return Err(error);
        }
        if self.started.elapsed() > self.shared.config.transaction_timeout {
            return Err(Error::TimedOut);
        }

        // Reads were checked against the snapshot as they happened
        if self.writes.is_empty() {
            self.committed = true;
            for armed in self.watches.drain(..) {
                let _ = armed.send(());
            }
            return Ok(());
        }

        let version = {
            let mut state = self.shared.state.write().await;

            let conflicted = self
                .reads
                .iter()
                .any(|(begin, end)| state.changed_since(begin, end, self.read_version));
            if conflicted {
                debug!(read_version = self.read_version, "Transaction conflict");
                return Err(Error::Conflict);
            }

            let version = state.version + 1;
            let mut batch_order: u16 = 0;
            for mutation in std::mem::take(&mut self.writes) {
                let key = match mutation {
                    Mutation::Set(key, value) => {
                        state.data.insert(key.clone(), value);
                        key
                    }
                    Mutation::Clear(key) => {
                        state.data.remove(&key);
                        key
                    }
                    Mutation::Add(key, delta) => {
                        let current = state.data.get(&key).map_or(0, |v| decode_counter(v));
                        state
                            .data
                            .insert(key.clone(), encode_counter(current.wrapping_add(delta)));
                        key
                    }
                    Mutation::SetVersionstamped(mut key, value) => {
                        let stamp = Versionstamp::new(version, batch_order, 0);
                        batch_order = batch_order.wrapping_add(1);
                        key.extend_from_slice(stamp.as_bytes());
                        state.data.insert(key.clone(), value);
                        key
                    }
                };
                state.modified.insert(key, version);
            }
            state.version = version;
            version
        };

        self.committed = true;
        for armed in self.watches.drain(..) {
            let _ = armed.send(());
        }
        self.shared.commits.send_replace(version);
        trace!(version, "Committed transaction");
        Ok(())
    }

    async fn on_error(&mut self, error: Error) -> Result<()> {
        if !error.is_retryable() {
            return Err(error);
        }

        self.attempts += 1;
        let config = &self.shared.config;
        if self.attempts > config.max_retries {
            return Err(Error::RetryLimitReached {
                attempts: self.attempts,
            });
        }

        let backoff = config.backoff_for(self.attempts);
        debug!(attempt = self.attempts, ?backoff, error = %error, "Retrying transaction");
        tokio::time::sleep(backoff).await;
        self.reset().await;
        Ok(())
    }
}
