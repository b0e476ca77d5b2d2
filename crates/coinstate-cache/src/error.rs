//! Error types for the coin cache and sync controller.

use bitcoin::OutPoint;
use coinstate_primitives::ChainPosition;

/// Errors raised by the cache and the sync controller.
///
/// The consistency variants are fatal: they indicate a broken invariant in
/// the surrounding pipeline (out-of-order block application, an undetected
/// reorg, a race with validation) and are never retried here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A block was applied on top of a tip the cache is not at.
    #[error("cache tip mismatch: cache is at {actual}, block was built on {claimed}")]
    TipMismatch {
        claimed: ChainPosition,
        actual: ChainPosition,
    },

    /// A creation change targeted an outpoint holding a live non-coinbase
    /// coin.
    #[error("refusing to overwrite unspent non-coinbase coin {0}")]
    CoinOverride(OutPoint),

    /// A spend change targeted an outpoint with no live coin.
    #[error("cannot spend missing coin {0}")]
    SpendMissingCoin(OutPoint),

    /// Dirty entries survived a flush; dirty state must never outlive one.
    #[error("{0} dirty cache entries survived a flush")]
    DirtyAfterFlush(usize),

    /// The canonical chain has no header at a height catch-up needs.
    #[error("no canonical header at height {0}")]
    MissingCanonicalHeader(u32),

    /// Catch-up can no longer make progress towards the canonical tip.
    #[error("catch-up stalled: cache at {cache_tip}, canonical tip {canonical_tip}")]
    CatchUpStalled {
        cache_tip: ChainPosition,
        canonical_tip: ChainPosition,
    },

    /// The catch-up replay loop was cancelled; processed blocks were
    /// flushed before propagating.
    #[error("sync cancelled")]
    Cancelled,

    /// Persistent store failure; propagated, never masked or retried.
    #[error(transparent)]
    Store(#[from] coinstate_store::Error),
}
