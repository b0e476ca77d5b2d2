//! Reconciles the coin store with the canonical chain after a reorg.

use crate::cache::CoinsCache;
use crate::{Error, Result};
use coinstate_chain_index::ChainIndex;
use coinstate_primitives::ChainPosition;
use coinstate_store::CoinStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rewind progress is logged once per this many blocks.
const REWIND_LOG_INTERVAL: u32 = 100;

/// Number of blocks replayed per catch-up batch.
const CATCH_UP_BATCH_SIZE: u32 = 1000;

/// Catch-up force-flushes the cache once per this many imported blocks.
const CATCH_UP_FLUSH_INTERVAL: u32 = 10_000;

/// The consensus rule engine boundary.
///
/// Replays one canonical block against the shared cache: load the affected
/// coins, validate, and apply the resulting changes via
/// [`CoinsCache::save_changes`] so the cache tip advances to `position`.
pub trait BlockImporter {
    fn import_block(&self, position: ChainPosition) -> Result<()>;
}

/// Where the controller is in the reconciliation process.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyncState {
    /// No sync has run yet.
    Uninitialized,
    /// The store tip matches the canonical chain tip.
    Synced,
    /// Rewinding the store down to the fork point.
    Rewinding {
        /// Height the store is being rewound to.
        target_height: u32,
    },
    /// Replaying canonical blocks on top of the fork point.
    CatchingUp {
        /// Height of the last applied block.
        current_height: u32,
        /// Canonical tip height being chased.
        target_height: u32,
    },
    /// An invariant violation surfaced; the controller must not be reused.
    Failed,
}

/// Drives the store back onto the canonical chain.
///
/// Runs on startup and whenever a reorg is suspected: detect divergence,
/// rewind the store to the fork point using its rewind records, then replay
/// canonical blocks through the [`BlockImporter`] until the tip is reached.
pub struct ChainstateSync<S, I> {
    cache: Arc<CoinsCache<S>>,
    chain_index: Arc<ChainIndex>,
    importer: I,
    cancelled: Arc<AtomicBool>,
    state: Mutex<SyncState>,
}

impl<S: CoinStore, I: BlockImporter> ChainstateSync<S, I> {
    pub fn new(cache: Arc<CoinsCache<S>>, chain_index: Arc<ChainIndex>, importer: I) -> Self {
        Self {
            cache,
            chain_index,
            importer,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SyncState::Uninitialized),
        }
    }

    /// Flag that aborts the catch-up loop when set.
    ///
    /// Cancellation is cooperative, checked once per replayed block; blocks
    /// already processed are flushed before [`Error::Cancelled`] surfaces.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Current controller state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Reconcile the store with the canonical chain.
    pub fn sync(&self) -> Result<()> {
        let result = self.sync_inner();
        if let Err(error) = &result {
            if !matches!(error, Error::Cancelled) {
                tracing::error!(%error, "Chainstate sync failed");
                *self.state.lock() = SyncState::Failed;
            }
        }
        result
    }

    fn sync_inner(&self) -> Result<()> {
        let canonical_tip = self.chain_index.tip().position();
        if self.cache.store_tip() == canonical_tip {
            *self.state.lock() = SyncState::Synced;
            return Ok(());
        }

        // Everything pending moves to the store first, so divergence is
        // judged (and rewound) against complete state.
        self.cache.flush(true)?;

        let store_tip = self.cache.store_tip();
        let diverged = store_tip.height > canonical_tip.height
            || !self.chain_index.is_canonical(&store_tip);
        if diverged {
            self.rewind_to_fork_point(store_tip)?;
        }

        if self.cache.tip() != canonical_tip {
            self.catch_up()?;
        }

        *self.state.lock() = SyncState::Synced;
        tracing::info!("Chainstate synced at {}", self.cache.tip());
        Ok(())
    }

    /// The position the store holds for the block at `height`.
    ///
    /// Below the tip this comes from the next block's rewind record, whose
    /// `previous_position` is the stored block at `height`.
    fn store_block_position(&self, height: u32, store_tip: &ChainPosition) -> Result<ChainPosition> {
        if height == store_tip.height {
            return Ok(*store_tip);
        }
        let record = self.cache.rewind_data(height + 1)?.ok_or(Error::Store(
            coinstate_store::Error::RewindRecordNotFound(height + 1),
        ))?;
        Ok(record.previous_position)
    }

    /// Lowest height at which the stored block is not on the canonical
    /// chain.
    ///
    /// Usable below, unusable above: the predicate is monotone, so a binary
    /// search over `1..=tip` finds the boundary. The caller guarantees the
    /// store tip itself is unusable.
    fn find_first_unusable(&self, store_tip: &ChainPosition) -> Result<u32> {
        let mut lo = 1u32;
        let mut hi = store_tip.height;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let position = self.store_block_position(mid, store_tip)?;
            if self.chain_index.is_canonical(&position) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(lo)
    }

    fn rewind_to_fork_point(&self, store_tip: ChainPosition) -> Result<()> {
        let first_unusable = self.find_first_unusable(&store_tip)?;
        let target_height = first_unusable - 1;

        *self.state.lock() = SyncState::Rewinding { target_height };
        tracing::info!(
            from = store_tip.height,
            to = target_height,
            "Store has left the canonical chain, rewinding"
        );

        let mut tip = store_tip;
        let mut blocks_rewound = 0u32;
        while tip.height > target_height {
            tip = self.cache.rewind(None)?;
            blocks_rewound += 1;
            if blocks_rewound % REWIND_LOG_INTERVAL == 0 {
                tracing::info!(height = tip.height, "Rewound {blocks_rewound} blocks");
            }
        }

        tracing::info!("Rewound {blocks_rewound} blocks, store back at {tip}");
        Ok(())
    }

    fn catch_up(&self) -> Result<()> {
        let mut imported_since_flush = 0u32;

        loop {
            // Re-read the canonical tip per batch; it may advance while we
            // replay.
            let canonical_tip = self.chain_index.tip().position();
            let cache_tip = self.cache.tip();

            if cache_tip == canonical_tip {
                break;
            }
            if cache_tip.height >= canonical_tip.height {
                return Err(Error::CatchUpStalled {
                    cache_tip,
                    canonical_tip,
                });
            }

            *self.state.lock() = SyncState::CatchingUp {
                current_height: cache_tip.height,
                target_height: canonical_tip.height,
            };

            let batch_end = canonical_tip
                .height
                .min(cache_tip.height + CATCH_UP_BATCH_SIZE);
            tracing::debug!(
                from = cache_tip.height + 1,
                to = batch_end,
                target = canonical_tip.height,
                "Replaying canonical blocks"
            );

            for height in cache_tip.height + 1..=batch_end {
                if self.cancelled.load(Ordering::Relaxed) {
                    self.cache.flush(true)?;
                    tracing::info!(
                        "Catch-up cancelled, flushed progress at {}",
                        self.cache.tip()
                    );
                    return Err(Error::Cancelled);
                }

                let header = self
                    .chain_index
                    .header_at(height)
                    .ok_or(Error::MissingCanonicalHeader(height))?;
                self.importer.import_block(header.position())?;

                imported_since_flush += 1;
                if imported_since_flush >= CATCH_UP_FLUSH_INTERVAL {
                    self.cache.flush(true)?;
                    imported_since_flush = 0;
                }
            }

            // A batch that moved the tip nowhere would loop forever.
            if self.cache.tip().height <= cache_tip.height {
                return Err(Error::CatchUpStalled {
                    cache_tip: self.cache.tip(),
                    canonical_tip,
                });
            }
        }

        self.cache.flush(true)?;
        Ok(())
    }
}
