//! The spendable-output payload and its storage key form.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, TxOut};
use serde::{Deserialize, Serialize};

/// Unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Whether the coin is from a coinbase transaction.
    pub is_coinbase: bool,
    /// Transfer value in satoshis.
    pub amount: u64,
    /// Block height at which the containing transaction was included.
    pub height: u32,
    /// Spending condition of the output.
    pub script_pubkey: Vec<u8>,
}

impl Coin {
    pub fn new(is_coinbase: bool, amount: u64, height: u32, script_pubkey: Vec<u8>) -> Self {
        Self {
            is_coinbase,
            amount,
            height,
            script_pubkey,
        }
    }

    /// Build a coin from a transaction output.
    pub fn from_txout(output: &TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            is_coinbase,
            amount: output.value.to_sat(),
            height,
            script_pubkey: output.script_pubkey.to_bytes(),
        }
    }

    /// Serialize to bytes for storage.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Coin serialization should not fail")
    }

    /// Deserialize from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Approximate in-memory/storage footprint in bytes.
    ///
    /// Fixed fields plus the script; used for the cache's byte budget and
    /// rewind-record size accounting, not for exact allocation tracking.
    pub fn size_estimate(&self) -> u64 {
        // is_coinbase + amount + height + script length prefix
        21 + self.script_pubkey.len() as u64
    }
}

/// Convert an outpoint to its storage key (36 bytes).
///
/// Format: txid (32 bytes, raw) || vout (4 bytes, little-endian)
pub fn outpoint_to_key(out_point: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(out_point.txid.as_ref());
    key[32..].copy_from_slice(&out_point.vout.to_le_bytes());
    key
}

/// Parse a storage key back to an outpoint.
pub fn key_to_outpoint(key: &[u8; 36]) -> OutPoint {
    let mut txid_bytes = [0u8; 32];
    txid_bytes.copy_from_slice(&key[..32]);
    let txid = bitcoin::Txid::from_byte_array(txid_bytes);
    let vout = u32::from_le_bytes(key[32..].try_into().expect("key is 36 bytes"));
    OutPoint { txid, vout }
}
