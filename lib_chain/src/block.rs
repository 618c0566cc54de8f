// The two block flavours of the simulation. Proof-of-work blocks carry a
// nonce and a difficulty and are sealed by grinding; dBFT blocks are bound
// by hash alone, with agreement coming from the consensus round instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::{now_millis, sha256_hex};
use crate::merkle::MerkleTree;
use crate::transaction::Transaction;

/// `previous_hash` of every genesis block.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Why a received block was rejected. Rejected blocks are dropped; the
/// sender is never told.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BlockError {
    /// The recomputed hash does not carry the required leading zeros.
    #[error("block hash does not meet difficulty {difficulty}")]
    DifficultyNotMet { difficulty: u32 },

    /// The recomputed hash disagrees with the hash the block claims,
    /// meaning it was mined on a different parent.
    #[error("block hash does not match its contents")]
    HashMismatch,
}

/// Check the difficulty predicate on a hex digest: the first `difficulty`
/// characters must be `'0'`, or at most `'7'` in binary mode (one leading
/// zero bit per character, making mining 2x harder per step instead of 16x).
pub fn hash_meets_difficulty(hash: &str, difficulty: u32, binary: bool) -> bool {
    let required = difficulty as usize;
    if hash.len() < required {
        return false;
    }
    hash.as_bytes()[..required]
        .iter()
        .all(|&c| if binary { c <= b'7' } else { c == b'0' })
}

/// A proof-of-work block. `hash` is the SHA-256 of
/// `previous_hash | merkle_root | nonce_decimal` and must satisfy the
/// difficulty predicate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PowBlock {
    pub previous_hash: String,
    pub merkle: MerkleTree,
    /// Millisecond epoch at which the nonce was found.
    pub timestamp: u64,
    pub nonce: u64,
    pub difficulty: u32,
    pub hash: String,
}

impl PowBlock {
    /// An unsealed candidate: nonce and hash still to be ground out.
    pub fn candidate(
        previous_hash: String,
        transactions: &[Transaction],
        difficulty: u32,
    ) -> PowBlock {
        PowBlock {
            previous_hash,
            merkle: MerkleTree::new(transactions),
            timestamp: 0,
            nonce: 0,
            difficulty,
            hash: String::new(),
        }
    }

    /// A genesis block with a single dummy coinbase transaction, mined
    /// from scratch so its hash also satisfies the initial difficulty.
    /// Every node grinds its own genesis; chains reconcile through the
    /// ordinary synchronization path.
    pub fn genesis(difficulty: u32, binary_hash: bool) -> PowBlock {
        let dummy = Transaction::new(0, 0, 0);
        let mut block =
            PowBlock::candidate(GENESIS_PREVIOUS_HASH.to_string(), &[dummy], difficulty);
        while !block.try_nonce(binary_hash) {}
        block
    }

    /// One proof-of-work step: bump the nonce, rehash, test the difficulty
    /// predicate. On success the timestamp records when the seal was found.
    pub fn try_nonce(&mut self, binary_hash: bool) -> bool {
        self.nonce += 1;
        self.hash = sha256_hex(self.seal_input().as_bytes());
        if !hash_meets_difficulty(&self.hash, self.difficulty, binary_hash) {
            return false;
        }
        self.timestamp = now_millis();
        true
    }

    /// Validate a received block against the hash of the local parent it
    /// would be appended to.
    pub fn verify(&self, local_previous_hash: &str, binary_hash: bool) -> Result<(), BlockError> {
        let recomputed = sha256_hex(
            format!("{}{}{}", local_previous_hash, self.merkle.root(), self.nonce).as_bytes(),
        );
        if !hash_meets_difficulty(&recomputed, self.difficulty, binary_hash) {
            return Err(BlockError::DifficultyNotMet {
                difficulty: self.difficulty,
            });
        }
        if recomputed != self.hash {
            return Err(BlockError::HashMismatch);
        }
        Ok(())
    }

    fn seal_input(&self) -> String {
        format!("{}{}{}", self.previous_hash, self.merkle.root(), self.nonce)
    }
}

/// A dBFT block. `hash` is the SHA-256 of `previous_hash | merkle_root`;
/// the timestamp is local and not covered by the hash, so chains agree
/// byte-for-byte on `hash` even though nodes stamp blocks independently.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DbftBlock {
    pub previous_hash: String,
    pub merkle: MerkleTree,
    pub timestamp: u64,
    pub hash: String,
}

impl DbftBlock {
    pub fn new(previous_hash: String, transactions: &[Transaction]) -> DbftBlock {
        let merkle = MerkleTree::new(transactions);
        let hash = sha256_hex(format!("{}{}", previous_hash, merkle.root()).as_bytes());
        DbftBlock {
            previous_hash,
            merkle,
            timestamp: now_millis(),
            hash,
        }
    }

    /// Genesis with the dummy coinbase transaction. Identical on every
    /// node because the hash covers only the zero parent and the dummy
    /// transaction.
    pub fn genesis() -> DbftBlock {
        DbftBlock::new(GENESIS_PREVIOUS_HASH.to_string(), &[Transaction::new(0, 0, 0)])
    }
}
