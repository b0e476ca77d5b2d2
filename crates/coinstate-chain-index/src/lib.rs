//! In-memory view of the canonical header chain.
//!
//! [`ChainIndex`] maintains height-indexed and hash-indexed maps of the
//! canonical chain under a single lock. [`ChainIndex::set_tip`] replaces
//! the branch above the fork point atomically, so no reader ever observes a
//! partially updated index.

use bitcoin::BlockHash;
use coinstate_primitives::ChainPosition;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised by the chain index.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The new tip does not share an ancestor with the current chain.
    #[error("header {0} does not connect to the current chain")]
    DisconnectedHeader(BlockHash),
}

/// A block header linked to its ancestors.
///
/// Only the fields this subsystem compares are kept: the hash, the height,
/// and the link to the previous header.
#[derive(Debug)]
pub struct ChainedHeader {
    /// Hash of the block.
    pub hash: BlockHash,
    /// Height of the block.
    pub height: u32,
    /// The previous header, `None` for genesis.
    pub previous: Option<Arc<ChainedHeader>>,
}

impl ChainedHeader {
    /// Create a genesis header.
    pub fn genesis(hash: BlockHash) -> Arc<Self> {
        Arc::new(Self {
            hash,
            height: 0,
            previous: None,
        })
    }

    /// Create a header on top of `previous`.
    pub fn chain(previous: &Arc<ChainedHeader>, hash: BlockHash) -> Arc<Self> {
        Arc::new(Self {
            hash,
            height: previous.height + 1,
            previous: Some(previous.clone()),
        })
    }

    /// The chain position of this header.
    pub fn position(&self) -> ChainPosition {
        ChainPosition::new(self.hash, self.height)
    }

    /// Walk back to the ancestor at `height`.
    ///
    /// Returns `None` if `height` is above this header.
    pub fn ancestor_at(self: &Arc<Self>, height: u32) -> Option<Arc<ChainedHeader>> {
        if height > self.height {
            return None;
        }
        let mut cursor = self.clone();
        while cursor.height > height {
            cursor = cursor.previous.clone()?;
        }
        Some(cursor)
    }
}

/// Highest common ancestor of two headers.
///
/// Returns `None` when the headers do not share a genesis.
pub fn fork_point(a: &Arc<ChainedHeader>, b: &Arc<ChainedHeader>) -> Option<Arc<ChainedHeader>> {
    let min_height = a.height.min(b.height);
    let mut a = a.ancestor_at(min_height)?;
    let mut b = b.ancestor_at(min_height)?;

    while a.hash != b.hash {
        a = a.previous.clone()?;
        b = b.previous.clone()?;
    }

    Some(a)
}

struct IndexInner {
    by_height: HashMap<u32, Arc<ChainedHeader>>,
    by_hash: HashMap<BlockHash, Arc<ChainedHeader>>,
    tip: Arc<ChainedHeader>,
}

/// Height- and hash-indexed view of the canonical header chain.
pub struct ChainIndex {
    inner: RwLock<IndexInner>,
}

impl ChainIndex {
    /// Create an index whose canonical chain is the ancestry of `tip`.
    pub fn new(tip: Arc<ChainedHeader>) -> Self {
        let mut by_height = HashMap::new();
        let mut by_hash = HashMap::new();

        let mut cursor = Some(tip.clone());
        while let Some(header) = cursor {
            by_height.insert(header.height, header.clone());
            by_hash.insert(header.hash, header.clone());
            cursor = header.previous.clone();
        }

        Self {
            inner: RwLock::new(IndexInner {
                by_height,
                by_hash,
                tip,
            }),
        }
    }

    /// The current canonical tip.
    pub fn tip(&self) -> Arc<ChainedHeader> {
        self.inner.read().tip.clone()
    }

    /// The canonical header at `height`, if any.
    pub fn header_at(&self, height: u32) -> Option<Arc<ChainedHeader>> {
        self.inner.read().by_height.get(&height).cloned()
    }

    /// The canonical header with the given hash, if any.
    pub fn header_for(&self, hash: &BlockHash) -> Option<Arc<ChainedHeader>> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    /// Whether `position` lies on the canonical chain.
    pub fn is_canonical(&self, position: &ChainPosition) -> bool {
        self.header_at(position.height)
            .is_some_and(|header| header.hash == position.hash)
    }

    /// Switch the canonical chain to the branch ending at `new_tip`.
    ///
    /// Entries above the fork point are removed from both maps and the new
    /// branch is inserted, all under one write lock.
    pub fn set_tip(&self, new_tip: Arc<ChainedHeader>) -> Result<(), Error> {
        let mut inner = self.inner.write();

        let fork = fork_point(&inner.tip, &new_tip)
            .ok_or_else(|| Error::DisconnectedHeader(new_tip.hash))?;

        // Drop the retracted branch.
        for height in (fork.height + 1)..=inner.tip.height {
            if let Some(header) = inner.by_height.remove(&height) {
                inner.by_hash.remove(&header.hash);
            }
        }

        // Insert the enacted branch, walking down from the new tip.
        let mut cursor = new_tip.clone();
        while cursor.height > fork.height {
            inner.by_height.insert(cursor.height, cursor.clone());
            inner.by_hash.insert(cursor.hash, cursor.clone());
            cursor = cursor
                .previous
                .clone()
                .ok_or(Error::DisconnectedHeader(new_tip.hash))?;
        }

        inner.tip = new_tip;

        Ok(())
    }
}
