//! The write-back coin cache.

use crate::{Error, Result};
use bitcoin::{BlockHash, OutPoint};
use coinstate_primitives::{BalanceUpdate, ChainPosition, Coin, CoinChange, RewindRecord};
use coinstate_store::{BalanceIter, CoinStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Configuration options for the coin cache.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Byte budget for cache entries plus pending rewind data; crossing it
    /// makes a non-forced flush proceed and triggers eviction sweeps.
    pub max_cache_bytes: u64,

    /// A non-forced flush proceeds once this much time passed since the
    /// previous one.
    pub flush_interval: Duration,

    /// Whether to accumulate per-destination balance deltas alongside coin
    /// changes.
    pub track_balances: bool,

    /// Seed for the eviction randomness; `None` seeds from entropy.
    pub eviction_seed: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_cache_bytes: 100 * 1024 * 1024,
            flush_interval: Duration::from_secs(60),
            track_balances: false,
            eviction_seed: None,
        }
    }
}

/// Counters for cache observability.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to the store.
    pub misses: u64,
    /// Entries removed by eviction sweeps.
    pub evictions: u64,
    /// Flushes that performed store I/O.
    pub flushes: u64,
}

/// One cache slot.
///
/// Invariants: an entry with `exists_in_store == false` and `coin == None`
/// never remains in the map, and a dirty entry is never evicted.
#[derive(Debug)]
struct CacheEntry {
    /// Current coin state; `None` means spent.
    coin: Option<Coin>,
    /// Whether the store holds (a possibly older version of) this outpoint.
    exists_in_store: bool,
    /// Whether this entry diverged from the store since the last flush.
    dirty: bool,
}

impl CacheEntry {
    fn size_estimate(&self) -> u64 {
        // Outpoint key plus flags plus the coin payload.
        38 + self.coin.as_ref().map_or(0, Coin::size_estimate)
    }
}

struct Inner {
    entries: HashMap<OutPoint, CacheEntry>,
    /// One record per applied block since the last flush, in chain order.
    pending_rewinds: Vec<RewindRecord>,
    /// Balance deltas accumulated since the last flush.
    balance_deltas: Vec<BalanceUpdate>,
    /// The block the cache state corresponds to; may be ahead of the store.
    cache_tip: ChainPosition,
    /// The store's tip as of the last flush.
    store_tip: ChainPosition,
    cache_size: u64,
    rewind_size: u64,
    last_flush: Instant,
    rng: fastrand::Rng,
    stats: CacheStats,
}

/// Write-back cache over a persistent coin store.
///
/// See the crate docs for the concurrency contract.
pub struct CoinsCache<S> {
    store: S,
    options: CacheOptions,
    inner: Mutex<Inner>,
}

impl<S: CoinStore> CoinsCache<S> {
    /// Bind a cache to `store`, adopting the store's tip.
    ///
    /// Only one cache instance must ever be bound to a given store.
    pub fn new(store: S, options: CacheOptions) -> Result<Self> {
        let tip = store.get_tip()?;
        let rng = match options.eviction_seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };

        Ok(Self {
            store,
            options,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pending_rewinds: Vec::new(),
                balance_deltas: Vec::new(),
                cache_tip: tip,
                store_tip: tip,
                cache_size: 0,
                rewind_size: 0,
                last_flush: Instant::now(),
                rng,
                stats: CacheStats::default(),
            }),
        })
    }

    /// Fetch the coins for `out_points`, hitting the store once for all
    /// misses.
    ///
    /// Absent coins map to `None`; they are returned but not retained in
    /// the cache.
    pub fn fetch_coins(
        &self,
        out_points: &[OutPoint],
    ) -> Result<HashMap<OutPoint, Option<Coin>>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut coins = HashMap::with_capacity(out_points.len());
        let mut missing = Vec::new();

        for out_point in out_points {
            match inner.entries.get(out_point) {
                Some(entry) => {
                    inner.stats.hits += 1;
                    coins.insert(*out_point, entry.coin.clone());
                }
                None => missing.push(*out_point),
            }
        }

        let fetched = self.fetch_missing_locked(inner, missing)?;
        coins.extend(fetched);

        Ok(coins)
    }

    /// Prefetch-only variant of [`CoinsCache::fetch_coins`], used to warm
    /// the cache ahead of validation.
    pub fn cache_coins(&self, out_points: &[OutPoint]) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut missing = Vec::new();
        for out_point in out_points {
            if inner.entries.contains_key(out_point) {
                inner.stats.hits += 1;
            } else {
                missing.push(*out_point);
            }
        }

        self.fetch_missing_locked(inner, missing)?;
        Ok(())
    }

    /// Populate the cache from one batched store read and run the eviction
    /// check that follows every store round-trip.
    fn fetch_missing_locked(
        &self,
        inner: &mut Inner,
        missing: Vec<OutPoint>,
    ) -> Result<HashMap<OutPoint, Option<Coin>>> {
        if missing.is_empty() {
            return Ok(HashMap::new());
        }

        inner.stats.misses += missing.len() as u64;
        let fetched = self.store.fetch(&missing)?;

        for (out_point, coin) in &fetched {
            if let Some(coin) = coin {
                let entry = CacheEntry {
                    coin: Some(coin.clone()),
                    exists_in_store: true,
                    dirty: false,
                };
                inner.cache_size += entry.size_estimate();
                inner.entries.insert(*out_point, entry);
            }
        }

        self.evict_locked(inner);
        Ok(fetched)
    }

    /// Apply one block's coin changes on top of `old_tip`.
    ///
    /// `old_tip` must equal the current cache tip; a mismatch means blocks
    /// are being applied out of order and fails before any mutation. The
    /// block's rewind record is accumulated in memory until the next flush.
    pub fn save_changes(
        &self,
        changes: Vec<CoinChange>,
        old_tip: ChainPosition,
        new_tip: ChainPosition,
    ) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.cache_tip != old_tip {
            return Err(Error::TipMismatch {
                claimed: old_tip,
                actual: inner.cache_tip,
            });
        }

        let mut record = RewindRecord::new(old_tip);
        let mut hit_store = false;

        for change in changes {
            let out_point = change.out_point;
            match change.coin {
                None => {
                    self.spend_locked(inner, &mut record, out_point, new_tip.height, &mut hit_store)?
                }
                Some(coin) => {
                    self.create_locked(inner, &mut record, out_point, coin, new_tip.height)?
                }
            }
        }

        tracing::trace!(
            height = new_tip.height,
            spent = record.spent_count(),
            created = record.created_count(),
            "Applied block changes"
        );

        inner.rewind_size += record.total_size;
        inner.pending_rewinds.push(record);
        inner.cache_tip = new_tip;

        if hit_store {
            self.evict_locked(inner);
        }

        Ok(())
    }

    fn spend_locked(
        &self,
        inner: &mut Inner,
        record: &mut RewindRecord,
        out_point: OutPoint,
        height: u32,
        hit_store: &mut bool,
    ) -> Result<()> {
        // A spend may target an evicted (or never cached) entry; that costs
        // exactly one store read.
        if !inner.entries.contains_key(&out_point) {
            *hit_store = true;
            inner.stats.misses += 1;
            let mut fetched = self.store.fetch(std::slice::from_ref(&out_point))?;
            let coin = fetched
                .remove(&out_point)
                .flatten()
                .ok_or(Error::SpendMissingCoin(out_point))?;
            let entry = CacheEntry {
                coin: Some(coin),
                exists_in_store: true,
                dirty: false,
            };
            inner.cache_size += entry.size_estimate();
            inner.entries.insert(out_point, entry);
        }

        let (coin, never_durable) = {
            let entry = inner
                .entries
                .get_mut(&out_point)
                .expect("entry was just ensured above");
            // Spending an already-cleared coin means the pipeline applied
            // something twice; fail loudly.
            let coin = entry.coin.take().ok_or(Error::SpendMissingCoin(out_point))?;
            let never_durable = !entry.exists_in_store;
            if !never_durable {
                entry.dirty = true;
            }
            (coin, never_durable)
        };

        inner.cache_size -= coin.size_estimate();
        if never_durable {
            // The store never saw this coin: drop the slot, no deletion to
            // flush. The rewind record still restores it so replaying the
            // record against the flushed state stays exact.
            inner.cache_size -= 38;
            inner.entries.remove(&out_point);
        }

        if self.options.track_balances {
            inner.balance_deltas.push(BalanceUpdate {
                script_pubkey: coin.script_pubkey.clone(),
                height,
                change_sat: -(coin.amount as i64),
            });
        }

        record.record_spend(out_point, coin);
        Ok(())
    }

    fn create_locked(
        &self,
        inner: &mut Inner,
        record: &mut RewindRecord,
        out_point: OutPoint,
        coin: Coin,
        height: u32,
    ) -> Result<()> {
        record.record_create(out_point);

        let mut size_delta = 0i64;
        match inner.entries.get_mut(&out_point) {
            Some(entry) => {
                if let Some(existing) = entry.coin.take() {
                    // Only a coinbase may be overwritten in place (the
                    // historical duplicate-coinbase case). Restoring the
                    // overridden coin keeps the rewind record exact.
                    if !existing.is_coinbase {
                        entry.coin = Some(existing);
                        return Err(Error::CoinOverride(out_point));
                    }
                    size_delta -= existing.size_estimate() as i64;
                    record.record_spend(out_point, existing);
                }
                size_delta += coin.size_estimate() as i64;
                entry.coin = Some(coin.clone());
                entry.dirty = true;
            }
            None => {
                // Brand-new output from a block: no store round-trip needed.
                let entry = CacheEntry {
                    coin: Some(coin.clone()),
                    exists_in_store: false,
                    dirty: true,
                };
                size_delta += entry.size_estimate() as i64;
                inner.entries.insert(out_point, entry);
            }
        }
        inner.cache_size = inner.cache_size.saturating_add_signed(size_delta);

        if self.options.track_balances {
            inner.balance_deltas.push(BalanceUpdate {
                script_pubkey: coin.script_pubkey,
                height,
                change_sat: coin.amount as i64,
            });
        }

        Ok(())
    }

    /// Flush dirty entries, pending rewind records and balance deltas to
    /// the store in one atomic save.
    ///
    /// Without `force` this is a no-op unless the flush interval elapsed or
    /// the byte budget is exceeded. A failed save leaves the dirty set
    /// untouched, so the flush is safe to repeat.
    pub fn flush(&self, force: bool) -> Result<()> {
        let mut guard = self.inner.lock();
        self.flush_locked(&mut guard, force)
    }

    fn flush_locked(&self, inner: &mut Inner, force: bool) -> Result<()> {
        if !force && !self.should_flush(inner) {
            return Ok(());
        }

        if inner.cache_tip == inner.store_tip
            && inner.pending_rewinds.is_empty()
            && inner.balance_deltas.is_empty()
        {
            // Nothing has happened since the last flush.
            inner.last_flush = Instant::now();
            return Ok(());
        }

        let dirty_coins: Vec<(OutPoint, Option<Coin>)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(out_point, entry)| (*out_point, entry.coin.clone()))
            .collect();

        self.store.save(
            dirty_coins,
            inner.balance_deltas.clone(),
            &inner.store_tip,
            &inner.cache_tip,
            inner.pending_rewinds.clone(),
        )?;

        // The save is durable; now reconcile the in-memory state with it.
        inner.entries.retain(|_, entry| {
            if !entry.dirty {
                return true;
            }
            entry.dirty = false;
            if entry.coin.is_some() {
                entry.exists_in_store = true;
                true
            } else {
                // A flushed deletion leaves a slot that carries no
                // information; drop it.
                false
            }
        });
        inner.cache_size = inner
            .entries
            .values()
            .map(CacheEntry::size_estimate)
            .sum();

        inner.pending_rewinds.clear();
        inner.balance_deltas.clear();
        inner.rewind_size = 0;
        inner.store_tip = inner.cache_tip;
        inner.last_flush = Instant::now();
        inner.stats.flushes += 1;

        tracing::debug!(
            entries = inner.entries.len(),
            cache_bytes = inner.cache_size,
            "Flushed cache, store now at {}",
            inner.store_tip
        );

        Ok(())
    }

    fn should_flush(&self, inner: &Inner) -> bool {
        inner.last_flush.elapsed() >= self.options.flush_interval
            || inner.cache_size + inner.rewind_size > self.options.max_cache_bytes
    }

    /// Probabilistic eviction sweep, run after every store round-trip.
    ///
    /// While over budget, removes roughly one in three clean durable
    /// entries in a single pass. Dirty or never-flushed entries carry
    /// information the store lacks and are never candidates.
    fn evict_locked(&self, inner: &mut Inner) {
        if inner.cache_size + inner.rewind_size <= self.options.max_cache_bytes {
            return;
        }

        let Inner {
            entries,
            rng,
            cache_size,
            stats,
            ..
        } = inner;

        entries.retain(|_, entry| {
            if entry.dirty || !entry.exists_in_store {
                return true;
            }
            if rng.u32(0..3) != 0 {
                return true;
            }
            *cache_size -= entry.size_estimate();
            stats.evictions += 1;
            false
        });
    }

    /// Force-flush, rewind the store, and rebind the cache to the result.
    ///
    /// The store holds the authoritative pre-rewind state once the flush
    /// completes; the cache is cleared entirely afterwards. `target: None`
    /// rewinds a single block.
    pub fn rewind(&self, target: Option<&ChainPosition>) -> Result<ChainPosition> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        self.flush_locked(inner, true)?;

        let dirty = inner.entries.values().filter(|entry| entry.dirty).count();
        if dirty > 0 {
            return Err(Error::DirtyAfterFlush(dirty));
        }

        let new_tip = self.store.rewind(target)?;

        inner.entries.clear();
        inner.cache_size = 0;
        inner.cache_tip = new_tip;
        inner.store_tip = new_tip;

        tracing::info!("Cache rewound to {new_tip}");

        Ok(new_tip)
    }

    /// Rewind data for the block at `height`: pending records first, then
    /// the store.
    pub fn rewind_data(&self, height: u32) -> Result<Option<RewindRecord>> {
        let inner = self.inner.lock();
        if let Some(record) = inner
            .pending_rewinds
            .iter()
            .find(|record| record.height() == height)
        {
            return Ok(Some(record.clone()));
        }
        drop(inner);

        Ok(self.store.get_rewind_record(height)?)
    }

    /// Cumulative balance history for a destination script.
    ///
    /// Reflects flushed state only; callers that need deltas from blocks
    /// still pending in the cache flush first.
    pub fn balance(&self, script_pubkey: &[u8]) -> Result<BalanceIter<'_>> {
        Ok(self.store.get_balance(script_pubkey)?)
    }

    /// The block the cache state corresponds to.
    pub fn tip(&self) -> ChainPosition {
        self.inner.lock().cache_tip
    }

    /// Hash of the cache tip.
    pub fn tip_hash(&self) -> BlockHash {
        self.inner.lock().cache_tip.hash
    }

    /// The store's tip as of the last flush.
    pub fn store_tip(&self) -> ChainPosition {
        self.inner.lock().store_tip
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Number of resident cache entries.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use coinstate_store::InMemoryCoinStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn position(height: u32) -> ChainPosition {
        ChainPosition::new(bitcoin::BlockHash::from_byte_array([height as u8; 32]), height)
    }

    fn out_point(n: u8) -> OutPoint {
        OutPoint {
            txid: bitcoin::Txid::from_byte_array([n; 32]),
            vout: 0,
        }
    }

    fn coin(amount: u64, height: u32) -> Coin {
        Coin::new(false, amount, height, vec![0x51])
    }

    /// Store wrapper that counts calls and can fail the next save.
    struct CountingStore {
        inner: InMemoryCoinStore,
        fetches: AtomicUsize,
        saves: AtomicUsize,
        fail_next_save: AtomicBool,
    }

    impl CountingStore {
        fn new(genesis: ChainPosition) -> Self {
            Self {
                inner: InMemoryCoinStore::new(genesis),
                fetches: AtomicUsize::new(0),
                saves: AtomicUsize::new(0),
                fail_next_save: AtomicBool::new(false),
            }
        }
    }

    impl CoinStore for CountingStore {
        fn get_tip(&self) -> coinstate_store::Result<ChainPosition> {
            self.inner.get_tip()
        }

        fn fetch(
            &self,
            out_points: &[OutPoint],
        ) -> coinstate_store::Result<HashMap<OutPoint, Option<Coin>>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(out_points)
        }

        fn save(
            &self,
            dirty_coins: Vec<(OutPoint, Option<Coin>)>,
            balance_deltas: Vec<BalanceUpdate>,
            old_tip: &ChainPosition,
            new_tip: &ChainPosition,
            rewind_records: Vec<RewindRecord>,
        ) -> coinstate_store::Result<()> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(coinstate_store::Error::Io(std::io::Error::other(
                    "injected save failure",
                )));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner
                .save(dirty_coins, balance_deltas, old_tip, new_tip, rewind_records)
        }

        fn rewind(
            &self,
            target: Option<&ChainPosition>,
        ) -> coinstate_store::Result<ChainPosition> {
            self.inner.rewind(target)
        }

        fn get_rewind_record(
            &self,
            height: u32,
        ) -> coinstate_store::Result<Option<RewindRecord>> {
            self.inner.get_rewind_record(height)
        }

        fn get_balance(
            &self,
            script_pubkey: &[u8],
        ) -> coinstate_store::Result<BalanceIter<'_>> {
            self.inner.get_balance(script_pubkey)
        }
    }

    fn seeded_options() -> CacheOptions {
        CacheOptions {
            eviction_seed: Some(42),
            ..Default::default()
        }
    }

    #[test]
    fn test_flush_with_nothing_pending_skips_store() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();

        cache.flush(true).unwrap();
        cache.flush(true).unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().flushes, 0);
    }

    #[test]
    fn test_unforced_flush_respects_thresholds() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();

        cache
            .save_changes(
                vec![CoinChange::create(out_point(1), coin(5_000, 1))],
                position(0),
                position(1),
            )
            .unwrap();

        // Neither the interval nor the byte budget was crossed, so neither
        // call performs store I/O.
        cache.flush(false).unwrap();
        cache.flush(false).unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert_eq!(cache.store_tip(), position(0));

        cache.flush(true).unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_block_apply_flush_rewind_scenario() {
        let store = Arc::new(CountingStore::new(position(10)));
        let spent_coin = Coin::new(false, 3_000, 4, vec![0x52]);
        // Seed a durable coin without moving the tip.
        store
            .inner
            .save(
                vec![(out_point(2), Some(spent_coin.clone()))],
                vec![],
                &position(10),
                &position(10),
                vec![],
            )
            .unwrap();

        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();
        cache.fetch_coins(&[out_point(2)]).unwrap();

        // Block 11 creates one output and spends the seeded one.
        cache
            .save_changes(
                vec![
                    CoinChange::create(out_point(1), Coin::new(false, 5_000, 11, vec![0x51])),
                    CoinChange::spend(out_point(2)),
                ],
                position(10),
                position(11),
            )
            .unwrap();
        cache.flush(true).unwrap();

        let record = cache.rewind_data(11).unwrap().unwrap();
        assert_eq!(record.outputs_to_restore, vec![(out_point(2), spent_coin.clone())]);
        assert_eq!(record.outputs_to_remove, vec![out_point(1)]);

        let tip = cache.rewind(Some(&position(10))).unwrap();
        assert_eq!(tip, position(10));
        let coins = cache.fetch_coins(&[out_point(1), out_point(2)]).unwrap();
        assert_eq!(coins[&out_point(1)], None);
        assert_eq!(coins[&out_point(2)], Some(spent_coin));
    }

    #[test]
    fn test_save_changes_guards_tip() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store, seeded_options()).unwrap();

        let err = cache
            .save_changes(vec![], position(3), position(4))
            .unwrap_err();
        assert!(matches!(err, Error::TipMismatch { .. }));
        assert_eq!(cache.tip(), position(0));
    }

    #[test]
    fn test_flush_writes_dirty_entries_and_records() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();

        cache
            .save_changes(
                vec![
                    CoinChange::create(out_point(1), coin(5_000, 1)),
                    CoinChange::create(out_point(2), coin(3_000, 1)),
                ],
                position(0),
                position(1),
            )
            .unwrap();
        assert_eq!(cache.tip(), position(1));
        assert_eq!(cache.store_tip(), position(0));

        cache.flush(true).unwrap();
        assert_eq!(cache.store_tip(), position(1));
        assert_eq!(store.inner.coin_count(), 2);
        assert!(store.inner.get_rewind_record(1).unwrap().is_some());

        // The rewind record moved to the store; it stays reachable.
        assert!(cache.rewind_data(1).unwrap().is_some());
    }

    #[test]
    fn test_failed_flush_is_repeatable() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();

        cache
            .save_changes(
                vec![CoinChange::create(out_point(1), coin(5_000, 1))],
                position(0),
                position(1),
            )
            .unwrap();

        store.fail_next_save.store(true, Ordering::SeqCst);
        assert!(cache.flush(true).is_err());

        // The dirty set survived the failure; the retry lands everything.
        cache.flush(true).unwrap();
        assert_eq!(store.inner.coin_count(), 1);
        assert_eq!(cache.store_tip(), position(1));
    }

    #[test]
    fn test_spend_of_uncached_coin_reads_store_once() {
        let store = Arc::new(CountingStore::new(position(0)));
        store
            .inner
            .save(
                vec![(out_point(1), Some(coin(5_000, 1)))],
                vec![],
                &position(0),
                &position(1),
                vec![RewindRecord::new(position(0))],
            )
            .unwrap();

        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();
        cache
            .save_changes(vec![CoinChange::spend(out_point(1))], position(1), position(2))
            .unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        // The deletion reaches the store on flush and the cache drops the
        // slot.
        cache.flush(true).unwrap();
        assert_eq!(store.inner.coin_count(), 0);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_spend_of_missing_coin_fails() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store, seeded_options()).unwrap();

        let err = cache
            .save_changes(vec![CoinChange::spend(out_point(9))], position(0), position(1))
            .unwrap_err();
        assert!(matches!(err, Error::SpendMissingCoin(_)));
    }

    #[test]
    fn test_create_and_spend_within_cache_never_touches_store() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();

        cache
            .save_changes(
                vec![CoinChange::create(out_point(1), coin(5_000, 1))],
                position(0),
                position(1),
            )
            .unwrap();
        cache
            .save_changes(vec![CoinChange::spend(out_point(1))], position(1), position(2))
            .unwrap();

        // Created and spent entirely in the cache: no entry left, no reads.
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);

        // The rewind record for block 2 still restores the coin.
        let record = cache.rewind_data(2).unwrap().unwrap();
        assert_eq!(record.outputs_to_restore.len(), 1);
        assert_eq!(record.outputs_to_restore[0].0, out_point(1));

        cache.flush(true).unwrap();
        assert_eq!(store.inner.coin_count(), 0);
    }

    #[test]
    fn test_non_coinbase_override_is_rejected() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store, seeded_options()).unwrap();

        cache
            .save_changes(
                vec![CoinChange::create(out_point(1), coin(5_000, 1))],
                position(0),
                position(1),
            )
            .unwrap();

        let err = cache
            .save_changes(
                vec![CoinChange::create(out_point(1), coin(1_000, 2))],
                position(1),
                position(2),
            )
            .unwrap_err();
        assert!(matches!(err, Error::CoinOverride(_)));
    }

    #[test]
    fn test_coinbase_override_records_old_coin() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store, seeded_options()).unwrap();

        let old = Coin::new(true, 5_000, 1, vec![0x51]);
        cache
            .save_changes(
                vec![CoinChange::create(out_point(1), old.clone())],
                position(0),
                position(1),
            )
            .unwrap();
        cache
            .save_changes(
                vec![CoinChange::create(out_point(1), Coin::new(true, 5_000, 2, vec![0x51]))],
                position(1),
                position(2),
            )
            .unwrap();

        let record = cache.rewind_data(2).unwrap().unwrap();
        assert_eq!(record.outputs_to_restore, vec![(out_point(1), old)]);
    }

    #[test]
    fn test_fetch_coins_caches_hits_but_not_misses() {
        let store = Arc::new(CountingStore::new(position(0)));
        store
            .inner
            .save(
                vec![(out_point(1), Some(coin(5_000, 1)))],
                vec![],
                &position(0),
                &position(1),
                vec![RewindRecord::new(position(0))],
            )
            .unwrap();

        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();
        let coins = cache.fetch_coins(&[out_point(1), out_point(2)]).unwrap();
        assert!(coins[&out_point(1)].is_some());
        assert!(coins[&out_point(2)].is_none());

        // Only the present coin was retained.
        assert_eq!(cache.entry_count(), 1);

        // The hit is now served locally; the miss hits the store again.
        cache.fetch_coins(&[out_point(1), out_point(2)]).unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_eviction_spares_dirty_entries() {
        let store = Arc::new(CountingStore::new(position(0)));
        let mut coins = Vec::new();
        for n in 1..=50 {
            coins.push((out_point(n), Some(coin(1_000, 1))));
        }
        store
            .inner
            .save(vec![], vec![], &position(0), &position(1), vec![
                RewindRecord::new(position(0)),
            ])
            .unwrap();
        store
            .inner
            .save(coins, vec![], &position(1), &position(2), vec![
                RewindRecord::new(position(1)),
            ])
            .unwrap();

        let options = CacheOptions {
            // Far below what 50 entries occupy, so every sweep fires.
            max_cache_bytes: 100,
            eviction_seed: Some(7),
            ..Default::default()
        };
        let cache = CoinsCache::new(store, options).unwrap();

        let all: Vec<OutPoint> = (1..=50).map(out_point).collect();
        cache.cache_coins(&all).unwrap();
        let after_fetch = cache.entry_count();
        assert!(after_fetch < 50, "sweep should remove clean entries");
        assert!(cache.stats().evictions > 0);

        // Dirty the survivors via a spend each; further sweeps must not
        // touch them.
        let changes: Vec<CoinChange> =
            (1..=5).map(|n| CoinChange::spend(out_point(n))).collect();
        cache.save_changes(changes, position(2), position(3)).unwrap();
        let dirty_before = cache.entry_count();
        cache.cache_coins(&all).unwrap();
        assert!(cache.entry_count() >= dirty_before.min(5));
        let spent = cache.fetch_coins(&[out_point(1)]).unwrap();
        assert_eq!(spent[&out_point(1)], None);
    }

    #[test]
    fn test_rewind_clears_cache_and_rebinds_tips() {
        let store = Arc::new(CountingStore::new(position(0)));
        let cache = CoinsCache::new(store.clone(), seeded_options()).unwrap();

        cache
            .save_changes(
                vec![CoinChange::create(out_point(1), coin(5_000, 1))],
                position(0),
                position(1),
            )
            .unwrap();
        let coin2 = coin(3_000, 2);
        cache
            .save_changes(
                vec![CoinChange::create(out_point(2), coin2)],
                position(1),
                position(2),
            )
            .unwrap();

        // Pending blocks are flushed before the store rewinds, so the
        // rewind sees the complete chain.
        let tip = cache.rewind(None).unwrap();
        assert_eq!(tip, position(1));
        assert_eq!(cache.tip(), position(1));
        assert_eq!(cache.store_tip(), position(1));
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(store.inner.coin_count(), 1);

        let fetched = cache.fetch_coins(&[out_point(2)]).unwrap();
        assert_eq!(fetched[&out_point(2)], None);
    }

    #[test]
    fn test_balance_deltas_reach_the_store() {
        let store = Arc::new(CountingStore::new(position(0)));
        let options = CacheOptions {
            track_balances: true,
            eviction_seed: Some(42),
            ..Default::default()
        };
        let cache = CoinsCache::new(store, options).unwrap();

        cache
            .save_changes(
                vec![
                    CoinChange::create(out_point(1), Coin::new(false, 10_000, 1, vec![0x51])),
                ],
                position(0),
                position(1),
            )
            .unwrap();
        cache
            .save_changes(vec![CoinChange::spend(out_point(1))], position(1), position(2))
            .unwrap();
        cache.flush(true).unwrap();

        let history: Vec<_> = cache
            .balance(&[0x51])
            .unwrap()
            .collect::<coinstate_store::Result<_>>()
            .unwrap();
        assert_eq!(history, vec![(1, 10_000), (2, 0)]);
    }
}
