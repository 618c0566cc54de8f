// A transaction represents a spending of currency. The difference between
// input and output is the fee, carried as miner incentive but never
// enforced. Signatures, balances and double-spend checks are out of scope;
// the simulation takes transaction validity as given.

use serde::{Deserialize, Serialize};

use crate::digest::now_millis;

/// One transfer moving through the pool. `id` is dense from 0 and doubles
/// as the pool index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: u64,
    pub input: u32,
    pub output: u32,
    /// Millisecond epoch at creation.
    pub creation_time: u64,
    /// Millisecond epoch when the pool confirmed it; 0 until then.
    pub confirmation_time: u64,
    /// How many nodes have independently confirmed it (proof-of-work only).
    pub confirmations: u32,
    /// Whether a miner currently holds it (proof-of-work only).
    pub collected: bool,
}

impl Transaction {
    pub fn new(id: u64, input: u32, output: u32) -> Transaction {
        Transaction {
            id,
            input,
            output,
            creation_time: now_millis(),
            confirmation_time: 0,
            confirmations: 0,
            collected: false,
        }
    }

    /// Serialize the transaction for hashing: three 8-hex-digit zero-padded
    /// lowercase integers, `id | input | output`. Lifecycle fields do not
    /// participate so that every node hashes a transaction identically
    /// regardless of when it saw it.
    pub fn to_hex_string(&self) -> String {
        format!("{:08x}{:08x}{:08x}", self.id, self.input, self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_serialization_is_zero_padded() {
        let tx = Transaction::new(1, 255, 100000);
        assert_eq!(tx.to_hex_string(), "00000001000000ff000186a0");
    }

    #[test]
    fn hex_serialization_ignores_lifecycle_fields() {
        let mut a = Transaction::new(7, 42, 43);
        let mut b = Transaction::new(7, 42, 43);
        a.collected = true;
        b.confirmations = 3;
        assert_eq!(a.to_hex_string(), b.to_hex_string());
    }
}
