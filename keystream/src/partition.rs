//! Routing of partition keys to partition indexes.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash.
///
/// Stable across processes and platforms, unlike `std`'s `DefaultHasher`.
#[must_use]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition index in `[0, partition_count)` for a partition key.
///
/// `partition_count` must be non-zero.
#[must_use]
pub fn partition_for(partition_key: &str, partition_count: u32) -> u32 {
    fnv1a32(partition_key.as_bytes()) % partition_count
}
