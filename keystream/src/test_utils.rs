//! Test utilities for keystream.
//!
//! [`FaultyStore`] wraps a [`MemoryStore`] and fails reads or commits on
//! demand with a non-retryable [`Error::Closed`], so tests can drive the
//! store-error paths of the consume loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use keystream_store::{
    Error, KeyValue, MemoryStore, MemoryTransaction, Result, Store, Transaction, Watch,
};

#[derive(Default)]
struct Faults {
    reads: AtomicBool,
    commits: AtomicBool,
}

/// A [`MemoryStore`] that fails operations while a fault is switched on.
#[derive(Clone)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Faults>,
}

impl FaultyStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    /// Fail every `get`, `first_key_after` and `get_range`.
    pub(crate) fn fail_reads(&self, fail: bool) {
        self.faults.reads.store(fail, Ordering::SeqCst);
    }

    /// Fail every commit.
    pub(crate) fn fail_commits(&self, fail: bool) {
        self.faults.commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.transaction().await,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FaultyTransaction {
    inner: MemoryTransaction,
    faults: Arc<Faults>,
}

/// Fails with [`Error::Closed`] while `fault` is set.
async fn inject(fault: &AtomicBool) -> Result<()> {
    if fault.load(Ordering::SeqCst) {
        // A failing loop must still let other tasks run
        tokio::task::yield_now().await;
        return Err(Error::Closed);
    }
    Ok(())
}

#[async_trait]
impl Transaction for FaultyTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        inject(&self.faults.reads).await?;
        self.inner.get(key).await
    }

    async fn first_key_after(&mut self, after: &[u8], end: &[u8]) -> Result<Option<Vec<u8>>> {
        inject(&self.faults.reads).await?;
        self.inner.first_key_after(after, end).await
    }

    async fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        inject(&self.faults.reads).await?;
        self.inner.get_range(begin, end, limit).await
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.inner.set(key, value);
    }

    fn clear(&mut self, key: &[u8]) {
        self.inner.clear(key);
    }

    fn atomic_add(&mut self, key: &[u8], delta: i64) {
        self.inner.atomic_add(key, delta);
    }

    fn set_versionstamped_key(&mut self, prefix: &[u8], value: &[u8]) {
        self.inner.set_versionstamped_key(prefix, value);
    }

    async fn watch(&mut self, key: &[u8]) -> Result<Watch> {
        self.inner.watch(key).await
    }

    async fn commit(&mut self) -> Result<()> {
        inject(&self.faults.commits).await?;
        self.inner.commit().await
    }

    async fn on_error(&mut self, error: Error) -> Result<()> {
        self.inner.on_error(error).await
    }
}
