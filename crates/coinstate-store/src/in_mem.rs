//! In-memory coin store for tests and light deployments.

use crate::{BalanceIter, CoinStore, Error, Result};
use bitcoin::OutPoint;
use coinstate_primitives::{BalanceUpdate, ChainPosition, Coin, RewindRecord};
use parking_lot::RwLock;
use std::collections::HashMap;

struct StoreInner {
    coins: HashMap<OutPoint, Coin>,
    rewinds: HashMap<u32, RewindRecord>,
    /// Per-destination `(height, net change)` deltas in apply order.
    balances: HashMap<Vec<u8>, Vec<(u32, i64)>>,
    tip: ChainPosition,
}

/// A [`CoinStore`] kept entirely in memory.
pub struct InMemoryCoinStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryCoinStore {
    /// Create an empty store whose tip is `genesis`.
    pub fn new(genesis: ChainPosition) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                coins: HashMap::new(),
                rewinds: HashMap::new(),
                balances: HashMap::new(),
                tip: genesis,
            }),
        }
    }

    /// Number of coins currently stored.
    pub fn coin_count(&self) -> usize {
        self.inner.read().coins.len()
    }

    fn rewind_one(inner: &mut StoreInner) -> Result<ChainPosition> {
        let height = inner.tip.height;
        if height == 0 {
            return Err(Error::NothingToRewind);
        }

        let record = inner
            .rewinds
            .remove(&height)
            .ok_or(Error::RewindRecordNotFound(height))?;

        for out_point in &record.outputs_to_remove {
            inner.coins.remove(out_point);
        }
        for (out_point, coin) in &record.outputs_to_restore {
            inner.coins.insert(*out_point, coin.clone());
        }
        for deltas in inner.balances.values_mut() {
            deltas.retain(|(delta_height, _)| *delta_height != height);
        }
        inner.balances.retain(|_, deltas| !deltas.is_empty());

        inner.tip = record.previous_position;
        Ok(inner.tip)
    }
}

impl CoinStore for InMemoryCoinStore {
    fn get_tip(&self) -> Result<ChainPosition> {
        Ok(self.inner.read().tip)
    }

    fn fetch(&self, out_points: &[OutPoint]) -> Result<HashMap<OutPoint, Option<Coin>>> {
        let inner = self.inner.read();
        Ok(out_points
            .iter()
            .map(|out_point| (*out_point, inner.coins.get(out_point).cloned()))
            .collect())
    }

    fn save(
        &self,
        dirty_coins: Vec<(OutPoint, Option<Coin>)>,
        balance_deltas: Vec<BalanceUpdate>,
        old_tip: &ChainPosition,
        new_tip: &ChainPosition,
        rewind_records: Vec<RewindRecord>,
    ) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.tip != *old_tip {
            return Err(Error::TipMismatch {
                expected: *old_tip,
                actual: inner.tip,
            });
        }

        for (out_point, coin) in dirty_coins {
            match coin {
                Some(coin) => {
                    inner.coins.insert(out_point, coin);
                }
                None => {
                    inner.coins.remove(&out_point);
                }
            }
        }

        for record in rewind_records {
            inner.rewinds.insert(record.height(), record);
        }

        for update in balance_deltas {
            let deltas = inner.balances.entry(update.script_pubkey).or_default();
            // Merge with the running entry for the same height so a rewind
            // can drop the height wholesale.
            match deltas.last_mut() {
                Some((height, change)) if *height == update.height => {
                    *change += update.change_sat;
                }
                _ => deltas.push((update.height, update.change_sat)),
            }
        }

        inner.tip = *new_tip;
        Ok(())
    }

    fn rewind(&self, target: Option<&ChainPosition>) -> Result<ChainPosition> {
        let mut inner = self.inner.write();

        match target {
            None => Self::rewind_one(&mut inner),
            Some(target) => {
                if target.height > inner.tip.height {
                    return Err(Error::InvalidRewindTarget(*target));
                }
                while inner.tip != *target {
                    if inner.tip.height <= target.height {
                        return Err(Error::InvalidRewindTarget(*target));
                    }
                    Self::rewind_one(&mut inner)?;
                }
                Ok(inner.tip)
            }
        }
    }

    fn get_rewind_record(&self, height: u32) -> Result<Option<RewindRecord>> {
        Ok(self.inner.read().rewinds.get(&height).cloned())
    }

    fn get_balance(&self, script_pubkey: &[u8]) -> Result<BalanceIter<'_>> {
        // Snapshot the deltas so the iterator does not hold the lock.
        let deltas: Vec<(u32, i64)> = self
            .inner
            .read()
            .balances
            .get(script_pubkey)
            .cloned()
            .unwrap_or_default();

        Ok(Box::new(crate::running_balance(
            deltas.into_iter().map(Ok),
        )))
    }
}
