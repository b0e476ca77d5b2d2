//! Core data model shared by the coinstate crates.
//!
//! The entities defined here travel between the write-back coin cache and
//! the persistent coin store: spendable outputs ([`Coin`]), chain tip
//! identities ([`ChainPosition`]), the per-block change unit handed to the
//! cache ([`CoinChange`]), per-block undo data ([`RewindRecord`]) and the
//! optional balance-index delta ([`BalanceUpdate`]).

mod coin;
mod rewind;

pub use coin::{key_to_outpoint, outpoint_to_key, Coin};
pub use rewind::RewindRecord;

use bitcoin::{BlockHash, OutPoint};
use serde::{Deserialize, Serialize};

/// A (block hash, height) pair identifying a point on the chain.
///
/// Used as the tip identity of both the cache and the persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainPosition {
    /// Hash of the block.
    pub hash: BlockHash,
    /// Height of the block.
    pub height: u32,
}

impl ChainPosition {
    pub fn new(hash: BlockHash, height: u32) -> Self {
        Self { hash, height }
    }
}

impl std::fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.hash, self.height)
    }
}

/// One output-level change produced by connecting a block.
///
/// `coin: Some(..)` creates the output, `coin: None` spends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinChange {
    /// The affected output.
    pub out_point: OutPoint,
    /// The new state of the output.
    pub coin: Option<Coin>,
}

impl CoinChange {
    /// A change that creates `out_point` with the given coin.
    pub fn create(out_point: OutPoint, coin: Coin) -> Self {
        Self {
            out_point,
            coin: Some(coin),
        }
    }

    /// A change that spends `out_point`.
    pub fn spend(out_point: OutPoint) -> Self {
        Self {
            out_point,
            coin: None,
        }
    }

    /// Whether this change spends the output.
    pub fn is_spend(&self) -> bool {
        self.coin.is_none()
    }
}

/// Net satoshi change for one destination script at one height.
///
/// Accumulated by the cache alongside coin changes and persisted by the
/// store into the balance index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    /// Destination script the change applies to.
    pub script_pubkey: Vec<u8>,
    /// Height of the block that produced the change.
    pub height: u32,
    /// Net change in satoshis (negative on spend).
    pub change_sat: i64,
}
