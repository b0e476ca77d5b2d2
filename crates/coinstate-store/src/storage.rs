//! Durable coin store implementation using RocksDB.
//!
//! Column family layout:
//! - `utxos`: outpoint key (36 bytes) -> serialized [`Coin`]
//! - `rewind`: block height (u32, big-endian) -> serialized [`RewindRecord`]
//! - `balances`: script-prefixed key -> net satoshi delta at one height
//! - `balances_by_height`: block height -> the delta list written at that
//!   height, kept so a rewind can reverse the balance index
//! - `meta`: the store tip

use crate::{BalanceIter, CoinStore, Error, Result};
use bitcoin::OutPoint;
use coinstate_primitives::{outpoint_to_key, BalanceUpdate, ChainPosition, Coin, RewindRecord};
use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::Path;

/// Column family names.
mod cf {
    pub const UTXOS: &str = "utxos";
    pub const REWIND: &str = "rewind";
    pub const BALANCES: &str = "balances";
    pub const BALANCES_BY_HEIGHT: &str = "balances_by_height";
    pub const META: &str = "meta";
}

/// Metadata keys.
mod meta_keys {
    pub const TIP: &[u8] = b"tip";
}

/// Balance key: `script_len (u16, big-endian) || script || height (u32,
/// big-endian)`.
///
/// The length prefix makes per-script prefix scans unambiguous; the height
/// suffix keeps each script's deltas in ascending height order.
fn balance_key(script_pubkey: &[u8], height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(6 + script_pubkey.len());
    key.extend_from_slice(&(script_pubkey.len() as u16).to_be_bytes());
    key.extend_from_slice(script_pubkey);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn balance_prefix(script_pubkey: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(2 + script_pubkey.len());
    prefix.extend_from_slice(&(script_pubkey.len() as u16).to_be_bytes());
    prefix.extend_from_slice(script_pubkey);
    prefix
}

/// A [`CoinStore`] backed by RocksDB.
pub struct RocksdbCoinStore {
    db: DB,
    /// Cached tip, always equal to the persisted one.
    tip: RwLock<ChainPosition>,
}

impl RocksdbCoinStore {
    /// Open or create a coin store at the given path.
    ///
    /// A fresh store starts at `genesis`; an existing one ignores the
    /// argument and resumes from its persisted tip.
    pub fn open(path: &Path, genesis: ChainPosition) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuned for the UTXO workload: large write buffers for flush
        // batches, bloom filters for point lookups.
        db_opts.set_write_buffer_size(256 * 1024 * 1024);
        db_opts.set_max_write_buffer_number(4);
        db_opts.set_target_file_size_base(256 * 1024 * 1024);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(cf::UTXOS, Options::default()),
            ColumnFamilyDescriptor::new(cf::REWIND, Options::default()),
            ColumnFamilyDescriptor::new(cf::BALANCES, Options::default()),
            ColumnFamilyDescriptor::new(cf::BALANCES_BY_HEIGHT, Options::default()),
            ColumnFamilyDescriptor::new(cf::META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let tip = match Self::load_tip(&db)? {
            Some(tip) => tip,
            None => {
                let cf_meta = db.cf_handle(cf::META).ok_or(Error::NotInitialized)?;
                db.put_cf(cf_meta, meta_keys::TIP, bincode::serialize(&genesis)?)?;
                genesis
            }
        };

        tracing::info!("Opened coin store at {tip}");

        Ok(Self {
            db,
            tip: RwLock::new(tip),
        })
    }

    fn load_tip(db: &DB) -> Result<Option<ChainPosition>> {
        let Some(cf) = db.cf_handle(cf::META) else {
            return Ok(None);
        };
        match db.get_cf(cf, meta_keys::TIP)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or(Error::NotInitialized)
    }

    /// Revert the block at the current tip. Must be called with the tip
    /// lock held for writing.
    fn rewind_one(&self, tip: &mut ChainPosition) -> Result<ChainPosition> {
        let height = tip.height;
        if height == 0 {
            return Err(Error::NothingToRewind);
        }

        let cf_utxos = self.cf_handle(cf::UTXOS)?;
        let cf_rewind = self.cf_handle(cf::REWIND)?;
        let cf_balances = self.cf_handle(cf::BALANCES)?;
        let cf_by_height = self.cf_handle(cf::BALANCES_BY_HEIGHT)?;
        let cf_meta = self.cf_handle(cf::META)?;

        let record_bytes = self
            .db
            .get_cf(cf_rewind, height.to_be_bytes())?
            .ok_or(Error::RewindRecordNotFound(height))?;
        let record = RewindRecord::decode(&record_bytes)?;

        let mut batch = WriteBatch::default();

        for out_point in &record.outputs_to_remove {
            batch.delete_cf(cf_utxos, outpoint_to_key(out_point));
        }
        for (out_point, coin) in &record.outputs_to_restore {
            batch.put_cf(cf_utxos, outpoint_to_key(out_point), coin.encode());
        }

        // Reverse the balance index. Each key in `balances` holds the whole
        // delta for one (script, height) pair, so reversal is deletion.
        if let Some(bytes) = self.db.get_cf(cf_by_height, height.to_be_bytes())? {
            let deltas: Vec<(Vec<u8>, i64)> = bincode::deserialize(&bytes)?;
            for (script_pubkey, _) in &deltas {
                batch.delete_cf(cf_balances, balance_key(script_pubkey, height));
            }
            batch.delete_cf(cf_by_height, height.to_be_bytes());
        }

        batch.delete_cf(cf_rewind, height.to_be_bytes());
        batch.put_cf(
            cf_meta,
            meta_keys::TIP,
            bincode::serialize(&record.previous_position)?,
        );

        self.db.write(batch)?;
        *tip = record.previous_position;

        tracing::debug!(
            "Reverted block {height}: -{} +{} coins, now at {tip}",
            record.created_count(),
            record.spent_count(),
        );

        Ok(*tip)
    }
}

impl CoinStore for RocksdbCoinStore {
    fn get_tip(&self) -> Result<ChainPosition> {
        Ok(*self.tip.read())
    }

    fn fetch(&self, out_points: &[OutPoint]) -> Result<HashMap<OutPoint, Option<Coin>>> {
        let cf_utxos = self.cf_handle(cf::UTXOS)?;

        let mut coins = HashMap::with_capacity(out_points.len());
        for out_point in out_points {
            let coin = match self.db.get_cf(cf_utxos, outpoint_to_key(out_point))? {
                Some(bytes) => Some(Coin::decode(&bytes)?),
                None => None,
            };
            coins.insert(*out_point, coin);
        }
        Ok(coins)
    }

    fn save(
        &self,
        dirty_coins: Vec<(OutPoint, Option<Coin>)>,
        balance_deltas: Vec<BalanceUpdate>,
        old_tip: &ChainPosition,
        new_tip: &ChainPosition,
        rewind_records: Vec<RewindRecord>,
    ) -> Result<()> {
        let mut tip = self.tip.write();

        if *tip != *old_tip {
            return Err(Error::TipMismatch {
                expected: *old_tip,
                actual: *tip,
            });
        }

        let cf_utxos = self.cf_handle(cf::UTXOS)?;
        let cf_rewind = self.cf_handle(cf::REWIND)?;
        let cf_balances = self.cf_handle(cf::BALANCES)?;
        let cf_by_height = self.cf_handle(cf::BALANCES_BY_HEIGHT)?;
        let cf_meta = self.cf_handle(cf::META)?;

        let mut batch = WriteBatch::default();
        let dirty_count = dirty_coins.len();
        let record_count = rewind_records.len();

        for (out_point, coin) in dirty_coins {
            let key = outpoint_to_key(&out_point);
            match coin {
                Some(coin) => batch.put_cf(cf_utxos, key, coin.encode()),
                None => batch.delete_cf(cf_utxos, key),
            }
        }

        for record in rewind_records {
            batch.put_cf(cf_rewind, record.height().to_be_bytes(), record.encode());
        }

        // Combine updates per (script, height) so each balance key is
        // written exactly once and reversal on rewind is a plain delete.
        let mut combined: HashMap<(Vec<u8>, u32), i64> = HashMap::new();
        for update in balance_deltas {
            *combined
                .entry((update.script_pubkey, update.height))
                .or_default() += update.change_sat;
        }
        let mut by_height: HashMap<u32, Vec<(Vec<u8>, i64)>> = HashMap::new();
        for ((script_pubkey, height), change_sat) in combined {
            batch.put_cf(
                cf_balances,
                balance_key(&script_pubkey, height),
                change_sat.to_le_bytes(),
            );
            by_height
                .entry(height)
                .or_default()
                .push((script_pubkey, change_sat));
        }
        for (height, deltas) in by_height {
            batch.put_cf(
                cf_by_height,
                height.to_be_bytes(),
                bincode::serialize(&deltas)?,
            );
        }

        batch.put_cf(cf_meta, meta_keys::TIP, bincode::serialize(new_tip)?);

        self.db.write(batch)?;
        *tip = *new_tip;

        tracing::debug!(
            dirty_coins = dirty_count,
            rewind_records = record_count,
            "Saved flush batch, store now at {}",
            *tip
        );

        Ok(())
    }

    fn rewind(&self, target: Option<&ChainPosition>) -> Result<ChainPosition> {
        let mut tip = self.tip.write();

        match target {
            None => self.rewind_one(&mut tip),
            Some(target) => {
                if target.height > tip.height {
                    return Err(Error::InvalidRewindTarget(*target));
                }
                while *tip != *target {
                    if tip.height <= target.height {
                        return Err(Error::InvalidRewindTarget(*target));
                    }
                    self.rewind_one(&mut tip)?;
                }
                Ok(*tip)
            }
        }
    }

    fn get_rewind_record(&self, height: u32) -> Result<Option<RewindRecord>> {
        let cf_rewind = self.cf_handle(cf::REWIND)?;
        match self.db.get_cf(cf_rewind, height.to_be_bytes())? {
            Some(bytes) => Ok(Some(RewindRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_balance(&self, script_pubkey: &[u8]) -> Result<BalanceIter<'_>> {
        let cf_balances = self.cf_handle(cf::BALANCES)?;
        let prefix = balance_prefix(script_pubkey);

        let deltas = self
            .db
            .iterator_cf(
                cf_balances,
                IteratorMode::From(&prefix, Direction::Forward),
            )
            .map(|item| item.map_err(Error::from))
            .take_while({
                let prefix = prefix.clone();
                move |item| match item {
                    Ok((key, _)) => key.starts_with(&prefix),
                    // Surface iterator errors instead of swallowing them.
                    Err(_) => true,
                }
            })
            .map(|item| {
                let (key, value) = item?;
                let height_bytes: [u8; 4] = key[key.len() - 4..]
                    .try_into()
                    .expect("balance keys end with a 4-byte height");
                let change_bytes: [u8; 8] = value
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::BalanceUnderflow(u32::from_be_bytes(height_bytes)))?;
                Ok((
                    u32::from_be_bytes(height_bytes),
                    i64::from_le_bytes(change_bytes),
                ))
            });

        Ok(Box::new(crate::running_balance(deltas)))
    }
}
