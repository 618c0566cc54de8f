// Shared memory the queues point into. Queue messages stay small; a full
// block travels through one of these slots instead.

use std::collections::BTreeMap;
use std::sync::Mutex;

use lib_chain::block::{DbftBlock, PowBlock};
use lib_chain::transaction::Transaction;

/// Proof-of-work block hand-off table. A sender inserts a block under the
/// lowest unused handle and puts the handle on the wire; the receiver
/// deletes the entry once the block is consumed.
pub struct BlockStore {
    slots: Mutex<BTreeMap<usize, PowBlock>>,
}

impl BlockStore {
    pub fn new() -> BlockStore {
        BlockStore {
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, block: PowBlock) -> usize {
        let mut slots = self.lock();
        let mut handle = 0;
        while slots.contains_key(&handle) {
            handle += 1;
        }
        slots.insert(handle, block);
        handle
    }

    /// Copy of the block under `handle`, leaving it in place.
    pub fn fetch(&self, handle: usize) -> Option<PowBlock> {
        self.lock().get(&handle).cloned()
    }

    pub fn remove(&self, handle: usize) -> Option<PowBlock> {
        self.lock().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<usize, PowBlock>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        BlockStore::new()
    }
}

/// The speaker's current proposal: the sampled transactions and the block
/// hash delegates must reproduce. A malicious speaker writes an empty
/// hash to force rejection.
#[derive(Debug, Clone, Default)]
pub struct Proposal {
    pub transactions: Vec<Transaction>,
    pub hash: String,
}

/// The two dBFT hand-off slots, shared by all bookkeepers in a run.
pub struct ConsensusSlots {
    pub proposal: Mutex<Proposal>,
    /// The full block written by whichever node first sees quorum. Starts
    /// as genesis so the first real proposal always differs from it.
    pub published: Mutex<DbftBlock>,
}

impl ConsensusSlots {
    pub fn new() -> ConsensusSlots {
        ConsensusSlots {
            proposal: Mutex::new(Proposal::default()),
            published: Mutex::new(DbftBlock::genesis()),
        }
    }
}

impl Default for ConsensusSlots {
    fn default() -> Self {
        ConsensusSlots::new()
    }
}
