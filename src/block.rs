use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A single block as decoded from the node's console stream.
///
/// Blocks are immutable once produced. The `id`/`previous_id` pair forms the
/// chain linkage; `num` increases monotonically but not strictly, since a
/// node may skip numbers or jump backwards across a fork.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub num: u64,
    /// Lowercase hex block identity.
    pub id: String,
    /// Lowercase hex identity of the parent block.
    pub previous_id: String,
    pub timestamp: DateTime<Utc>,
    /// Highest block number known to be irreversible at production time.
    pub lib_num: u64,
    /// Opaque serialized block record.
    pub payload: Bytes,
}

impl Block {
    /// Age of this block relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        now - self.timestamp
    }
}
