// Merkle trees summarise the transactions in a block, with the root value
// bound into the block hash. The tree is stored as one flat vector built
// from the leaves upward; in a full binary tree of n leaves there are
// 2n - 1 nodes and the root is the last one.

use serde::{Deserialize, Serialize};

use crate::digest::sha256_hex;
use crate::transaction::Transaction;

/// Summary of an ordered transaction list. The ids of the summarised
/// transactions are retained so a block can later tell the pool which
/// entries to confirm.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// Ids of the input transactions, in block order.
    pub transaction_ids: Vec<u64>,
    /// Every node of the tree, leaves first, root last.
    hashes: Vec<String>,
}

impl MerkleTree {
    /// Build the tree: hash each transaction into a leaf (duplicating the
    /// last one when the count is odd), then combine sibling digests
    /// pairwise until a single root remains.
    pub fn new(transactions: &[Transaction]) -> MerkleTree {
        let transaction_ids = transactions.iter().map(|tx| tx.id).collect();

        let mut hashes: Vec<String> = transactions
            .iter()
            .map(|tx| sha256_hex(tx.to_hex_string().as_bytes()))
            .collect();

        if hashes.is_empty() {
            return MerkleTree {
                transaction_ids,
                hashes,
            };
        }

        if hashes.len() % 2 == 1 {
            let last = hashes[hashes.len() - 1].clone();
            hashes.push(last);
        }

        let node_count = 2 * hashes.len() - 1;
        let mut i = 0;
        while hashes.len() < node_count {
            let pair = format!("{}{}", hashes[i], hashes[i + 1]);
            hashes.push(sha256_hex(pair.as_bytes()));
            i += 2;
        }

        MerkleTree {
            transaction_ids,
            hashes,
        }
    }

    /// The root digest. Empty for an empty transaction list; both sides of
    /// a validation compute the same function, so agreement is unaffected.
    pub fn root(&self) -> &str {
        self.hashes.last().map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txs(count: u64) -> Vec<Transaction> {
        (0..count).map(|i| Transaction::new(i, 10, 20)).collect()
    }

    #[test]
    fn same_transactions_same_root() {
        let a = MerkleTree::new(&txs(4));
        let b = MerkleTree::new(&txs(4));
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn odd_leaf_count_duplicates_the_tail() {
        let three = txs(3);
        let mut four = txs(3);
        four.push(three[2].clone());
        assert_eq!(MerkleTree::new(&three).root(), MerkleTree::new(&four).root());
    }

    #[test]
    fn transaction_ids_are_retained_in_order() {
        let tree = MerkleTree::new(&txs(5));
        assert_eq!(tree.transaction_ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn order_changes_the_root() {
        let forward = txs(2);
        let reversed: Vec<Transaction> = forward.iter().rev().cloned().collect();
        assert_ne!(
            MerkleTree::new(&forward).root(),
            MerkleTree::new(&reversed).root()
        );
    }

    #[test]
    fn empty_list_has_empty_root() {
        let tree = MerkleTree::new(&[]);
        assert_eq!(tree.root(), "");
        assert!(tree.transaction_ids.is_empty());
    }

    #[test]
    fn single_leaf_root_is_pair_of_duplicates() {
        let one = txs(1);
        let leaf = sha256_hex(one[0].to_hex_string().as_bytes());
        let expected = sha256_hex(format!("{}{}", leaf, leaf).as_bytes());
        assert_eq!(MerkleTree::new(&one).root(), expected);
    }
}
