//! Value encodings understood by the store's atomic operations.

/// Encode a counter the way [`Transaction::atomic_add`](crate::Transaction::atomic_add) stores it.
#[must_use]
pub fn encode_counter(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode a little-endian counter. Short values are zero-extended and bytes
/// past the eighth are ignored.
#[must_use]
pub fn decode_counter(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    i64::from_le_bytes(buf)
}
