//! Write-back UTXO cache with exact per-block rewind data.
//!
//! [`CoinsCache`] sits above a persistent [`CoinStore`] and serves coin
//! lookups during block validation, batches writes into periodic flushes,
//! and keeps one [`RewindRecord`] per applied block so any batch of changes
//! can be reversed exactly. [`ChainstateSync`] reconciles the store with
//! the canonical chain after a reorganization: rewind to the fork point,
//! then replay blocks through the consensus rule engine.
//!
//! ## Concurrency contract
//!
//! All cache state lives behind a single lock and every public method holds
//! it for its whole duration. `flush` and `rewind` must only be called from
//! the validation pipeline context (or while it is stopped): concurrent
//! block validation must never race with a flush or rewind.
//!
//! [`RewindRecord`]: coinstate_primitives::RewindRecord
//! [`CoinStore`]: coinstate_store::CoinStore

mod cache;
mod error;
mod sync;

pub use cache::{CacheOptions, CacheStats, CoinsCache};
pub use error::Error;
pub use sync::{BlockImporter, ChainstateSync, SyncState};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
