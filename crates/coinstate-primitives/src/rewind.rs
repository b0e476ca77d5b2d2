//! Per-block rewind data.
//!
//! When a block is applied, the cache records the coins it spent and the
//! outpoints it created. Replaying that record against the post-block state
//! must reproduce the pre-block state exactly; this is the core correctness
//! invariant of the subsystem.

use crate::{ChainPosition, Coin};
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

/// Cost charged per outpoint in [`RewindRecord::total_size`] accounting.
const OUTPOINT_SIZE: u64 = 36;

/// Undo data for a single block.
///
/// Contains all information needed to reverse the block's coin changes:
/// restore what it spent, remove what it created, and step the tip back to
/// [`RewindRecord::previous_position`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindRecord {
    /// Tip position before the block that produced this record was applied.
    pub previous_position: ChainPosition,
    /// Coins spent by the block, to be restored on rewind.
    pub outputs_to_restore: Vec<(OutPoint, Coin)>,
    /// Outpoints created by the block, to be removed on rewind.
    pub outputs_to_remove: Vec<OutPoint>,
    /// Approximate serialized size of this record in bytes.
    pub total_size: u64,
}

impl RewindRecord {
    /// Create an empty record for the block following `previous_position`.
    pub fn new(previous_position: ChainPosition) -> Self {
        Self {
            previous_position,
            outputs_to_restore: Vec::new(),
            outputs_to_remove: Vec::new(),
            total_size: 0,
        }
    }

    /// Height of the block this record can rewind.
    pub fn height(&self) -> u32 {
        self.previous_position.height + 1
    }

    /// Record a spent coin.
    pub fn record_spend(&mut self, out_point: OutPoint, coin: Coin) {
        self.total_size += OUTPOINT_SIZE + coin.size_estimate();
        self.outputs_to_restore.push((out_point, coin));
    }

    /// Record a created outpoint.
    pub fn record_create(&mut self, out_point: OutPoint) {
        self.total_size += OUTPOINT_SIZE;
        self.outputs_to_remove.push(out_point);
    }

    /// Serialize to bytes for storage.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("RewindRecord serialization should not fail")
    }

    /// Deserialize from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Returns the number of coins spent by the block.
    pub fn spent_count(&self) -> usize {
        self.outputs_to_restore.len()
    }

    /// Returns the number of outpoints created by the block.
    pub fn created_count(&self) -> usize {
        self.outputs_to_remove.len()
    }

    /// Returns true if no coin changes were recorded.
    pub fn is_empty(&self) -> bool {
        self.outputs_to_restore.is_empty() && self.outputs_to_remove.is_empty()
    }
}
