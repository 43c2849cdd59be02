//! Partition-scoped keys
//!
//! Every key generated on a partition carries the partition id in its upper
//! bits, so any component can tell which partition owns an entity (or which
//! partition started a command distribution) from the key alone.

pub const PARTITION_BITS: u32 = 13;
pub const KEY_BITS: u32 = 64 - 1 - PARTITION_BITS;

/// Partition ids start at 1.
pub const START_PARTITION_ID: u32 = 1;

/// Placeholder for "no key" / "no position".
pub const NONE: i64 = -1;

const COUNTER_MASK: i64 = (1i64 << KEY_BITS) - 1;

pub fn encode_key(partition_id: u32, counter: i64) -> i64 {
    ((partition_id as i64) << KEY_BITS) | (counter & COUNTER_MASK)
}

pub fn decode_partition_id(key: i64) -> u32 {
    if key < 0 {
        return 0;
    }
    (key >> KEY_BITS) as u32
}

pub fn decode_counter(key: i64) -> i64 {
    key & COUNTER_MASK
}

/// Lowest key a partition can generate.
pub fn first_key(partition_id: u32) -> i64 {
    encode_key(partition_id, 0)
}
