//! Persistent coin storage for the coinstate cache.
//!
//! The [`CoinStore`] trait is the boundary between the write-back cache and
//! durable storage: batched coin lookups, one atomic save per flush, and
//! block-at-a-time rewind driven by stored [`RewindRecord`]s. Two
//! implementations are provided and selected at construction time:
//! [`InMemoryCoinStore`] for tests and light deployments, and
//! [`RocksdbCoinStore`] for production.

mod in_mem;
mod storage;

pub use in_mem::InMemoryCoinStore;
pub use storage::RocksdbCoinStore;

use bitcoin::OutPoint;
use coinstate_primitives::{BalanceUpdate, ChainPosition, Coin, RewindRecord};
use std::collections::HashMap;

/// Result type for coin store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during coin store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Bincode serialization/deserialization error.
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The tip recorded in the store does not match the tip the caller
    /// believes it is writing on top of.
    #[error("store tip mismatch: store is at {actual}, caller expected {expected}")]
    TipMismatch {
        expected: ChainPosition,
        actual: ChainPosition,
    },

    /// Rewind data not found for a block that should have some.
    #[error("rewind record not found for height {0}")]
    RewindRecordNotFound(u32),

    /// Rewind requested but the store is at genesis.
    #[error("nothing to rewind: store is at genesis")]
    NothingToRewind,

    /// The rewind target is above the store tip or not on the stored chain.
    #[error("invalid rewind target {0}")]
    InvalidRewindTarget(ChainPosition),

    /// The balance index went negative, which means it is corrupt.
    #[error("balance underflow for destination at height {0}")]
    BalanceUnderflow(u32),

    /// Store not initialized.
    #[error("store not initialized")]
    NotInitialized,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lazy cumulative balance sequence: `(height, cumulative satoshis)`,
/// ascending by height, finite, restartable per call.
pub type BalanceIter<'a> = Box<dyn Iterator<Item = Result<(u32, u64)>> + 'a>;

/// Durable key-value storage of coins, rewind records and balance deltas,
/// addressed by chain position.
///
/// Exactly one cache instance should ever be bound to a given store; the
/// store's tip only advances through [`CoinStore::save`].
pub trait CoinStore: Send + Sync {
    /// The position the store's coin set currently corresponds to.
    fn get_tip(&self) -> Result<ChainPosition>;

    /// Batched coin lookup.
    ///
    /// The returned map has one entry per requested outpoint; absent coins
    /// map to `None`.
    fn fetch(&self, out_points: &[OutPoint]) -> Result<HashMap<OutPoint, Option<Coin>>>;

    /// Atomically persist one flush worth of changes.
    ///
    /// `dirty_coins` entries with `None` delete the coin. `old_tip` must
    /// match the store's current tip; on success the tip becomes `new_tip`.
    /// Either everything in the batch lands or nothing does.
    fn save(
        &self,
        dirty_coins: Vec<(OutPoint, Option<Coin>)>,
        balance_deltas: Vec<BalanceUpdate>,
        old_tip: &ChainPosition,
        new_tip: &ChainPosition,
        rewind_records: Vec<RewindRecord>,
    ) -> Result<()>;

    /// Rewind stored state one block at a time until the tip equals
    /// `target`, or exactly one block when `target` is `None`.
    ///
    /// Returns the resulting tip.
    fn rewind(&self, target: Option<&ChainPosition>) -> Result<ChainPosition>;

    /// The rewind record for the block at `height`, if present.
    fn get_rewind_record(&self, height: u32) -> Result<Option<RewindRecord>>;

    /// Cumulative balance history of a destination script.
    fn get_balance(&self, script_pubkey: &[u8]) -> Result<BalanceIter<'_>>;
}

impl<T: CoinStore + ?Sized> CoinStore for std::sync::Arc<T> {
    fn get_tip(&self) -> Result<ChainPosition> {
        self.as_ref().get_tip()
    }

    fn fetch(&self, out_points: &[OutPoint]) -> Result<HashMap<OutPoint, Option<Coin>>> {
        self.as_ref().fetch(out_points)
    }

    fn save(
        &self,
        dirty_coins: Vec<(OutPoint, Option<Coin>)>,
        balance_deltas: Vec<BalanceUpdate>,
        old_tip: &ChainPosition,
        new_tip: &ChainPosition,
        rewind_records: Vec<RewindRecord>,
    ) -> Result<()> {
        self.as_ref()
            .save(dirty_coins, balance_deltas, old_tip, new_tip, rewind_records)
    }

    fn rewind(&self, target: Option<&ChainPosition>) -> Result<ChainPosition> {
        self.as_ref().rewind(target)
    }

    fn get_rewind_record(&self, height: u32) -> Result<Option<RewindRecord>> {
        self.as_ref().get_rewind_record(height)
    }

    fn get_balance(&self, script_pubkey: &[u8]) -> Result<BalanceIter<'_>> {
        self.as_ref().get_balance(script_pubkey)
    }
}

/// Accumulate cumulative balances over a height-ascending delta sequence.
///
/// Shared by both store implementations so their balance iterators agree.
fn running_balance(
    deltas: impl Iterator<Item = Result<(u32, i64)>>,
) -> impl Iterator<Item = Result<(u32, u64)>> {
    let mut total: i64 = 0;
    deltas.map(move |item| {
        let (height, change_sat) = item?;
        total += change_sat;
        u64::try_from(total)
            .map(|cumulative| (height, cumulative))
            .map_err(|_| Error::BalanceUnderflow(height))
    })
}
