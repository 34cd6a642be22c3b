//! Transactional ordered key-value store capability for keystream.
//!
//! keystream builds its streams on any store offering serializable
//! transactions, ordered range reads, atomic increments, watches and
//! commit-ordered versionstamped keys. This crate describes that capability
//! as traits and ships an in-memory implementation.
//!
//! # Key Types
//!
//! - [`Store`] - Trait for starting transactions
//! - [`Transaction`] - Trait for reads, buffered writes and commit
//! - [`Versionstamp`] - Commit-ordered key suffix
//! - [`Watch`] - Future resolving when a key changes
//! - [`MemoryStore`] - In-memory implementation of Store

pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod traits;

// Re-exports
pub use codec::{decode_counter, encode_counter};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use memory::{MemoryStore, MemoryTransaction};
pub use traits::{KeyValue, Store, Transaction, VERSIONSTAMP_LEN, Versionstamp, Watch};
