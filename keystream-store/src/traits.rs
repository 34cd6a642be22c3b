//! Core traits for transactional store operations.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::error::Result;

/// Length of an encoded versionstamp in bytes.
pub const VERSIONSTAMP_LEN: usize = 12;

/// Commit-time key suffix that sorts keys by commit order.
///
/// Layout: 8-byte big-endian commit version, 2-byte big-endian batch order
/// (position of the write within its transaction), 2-byte user version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Versionstamp([u8; VERSIONSTAMP_LEN]);

impl Versionstamp {
    /// Build a versionstamp from its components.
    #[must_use]
    pub fn new(commit_version: u64, batch_order: u16, user_version: u16) -> Self {
        let mut bytes = [0u8; VERSIONSTAMP_LEN];
        bytes[..8].copy_from_slice(&commit_version.to_be_bytes());
        bytes[8..10].copy_from_slice(&batch_order.to_be_bytes());
        bytes[10..].copy_from_slice(&user_version.to_be_bytes());
        Self(bytes)
    }

    /// Parse a versionstamp from exactly [`VERSIONSTAMP_LEN`] bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn commit_version(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    pub fn batch_order(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]])
    }

    pub fn user_version(&self) -> u16 {
        u16::from_be_bytes([self.0[10], self.0[11]])
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONSTAMP_LEN] {
        &self.0
    }
}

impl fmt::Debug for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Versionstamp({}:{}:{})",
            self.commit_version(),
            self.batch_order(),
            self.user_version()
        )
    }
}

/// A key/value pair returned from a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Resolves once the watched key changes.
///
/// Returned by [`Transaction::watch`]. A watch is armed when its transaction
/// commits; dropping the transaction uncommitted cancels it.
pub struct Watch {
    future: Pin<Box<dyn Future<Output = Result<()>> + Send>>,
}

impl Watch {
    /// Wrap a store-specific future that completes when the key changes.
    pub fn new(future: impl Future<Output = Result<()>> + Send + 'static) -> Self {
        Self {
            future: Box::pin(future),
        }
    }

    /// Wait until the watched key's value differs from the one the
    /// transaction observed.
    pub async fn changed(self) -> Result<()> {
        self.future.await
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").finish_non_exhaustive()
    }
}

/// An ordered key-value store offering serializable transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// A serializable transaction over an ordered key space.
///
/// Writes are buffered until [`commit`](Transaction::commit). A commit fails
/// with a retryable error when another transaction modified anything this one
/// read. Reads may fail the same way when they can no longer be served from
/// the transaction's snapshot. Pass such errors to
/// [`on_error`](Transaction::on_error) to reset and retry.
#[async_trait]
pub trait Transaction: Send {
    /// Read the value stored at `key`.
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Smallest key strictly greater than `after` and strictly less than `end`.
    async fn first_key_after(&mut self, after: &[u8], end: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Read up to `limit` pairs with keys in `[begin, end)`, in key order.
    async fn get_range(&mut self, begin: &[u8], end: &[u8], limit: usize)
    -> Result<Vec<KeyValue>>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    /// Add `delta` to the little-endian 64-bit counter at `key`.
    ///
    /// Does not read the key, so concurrent adds never conflict.
    fn atomic_add(&mut self, key: &[u8], delta: i64);

    /// Write `value` at `prefix` followed by the commit versionstamp.
    fn set_versionstamped_key(&mut self, prefix: &[u8], value: &[u8]);

    /// Watch `key` for changes relative to this transaction's view of it.
    async fn watch(&mut self, key: &[u8]) -> Result<Watch>;

    /// Commit all buffered writes atomically.
    async fn commit(&mut self) -> Result<()>;

    /// Reset the transaction for another attempt if `error` is retryable,
    /// after backing off. Returns the error otherwise, or once the retry
    /// limit is reached.
    async fn on_error(&mut self, error: crate::Error) -> Result<()>;
}
