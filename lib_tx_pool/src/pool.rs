// The pool of unconfirmed transactions, shared by every node in a run.
// The generator appends, miners claim entries at random (and may hand them
// back after a lost race), bookkeepers scan from a cursor, and fully
// confirmed entries are evicted after their latency is written out.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use lib_chain::digest::now_millis;
use lib_chain::transaction::Transaction;

use crate::telemetry::CsvSink;

/// A transaction that completed its lifecycle, kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTransaction {
    pub id: u64,
    pub creation_time: u64,
    pub confirmation_time: u64,
}

/// Shared transaction pool. Entries are indexed by transaction id (dense
/// from 0) and become `None` once confirmed; readers skip the holes.
pub struct TxPool {
    entries: Mutex<Vec<Option<Transaction>>>,
    /// How many independent `confirm` calls retire an entry: the node
    /// count for proof-of-work, 1 for dBFT where finality is protocol
    /// guaranteed.
    confirmations_required: u32,
    /// Ring of recently confirmed transactions for the dashboard.
    recent: Mutex<Vec<ConfirmedTransaction>>,
    transactions_to_show: usize,
    /// Pause between generated transactions, reused as the empty-pool
    /// retry interval.
    transaction_frequency: Duration,
    sink: CsvSink,
}

impl TxPool {
    pub fn new(
        confirmations_required: u32,
        transactions_to_show: usize,
        transaction_frequency: Duration,
        sink: CsvSink,
    ) -> TxPool {
        TxPool {
            entries: Mutex::new(Vec::new()),
            confirmations_required,
            recent: Mutex::new(Vec::new()),
            transactions_to_show,
            transaction_frequency,
            sink,
        }
    }

    /// Generator loop: append one random transaction per interval,
    /// forever. The orchestrator's main thread becomes this after
    /// spawning the workers.
    pub fn run_generator(&self) -> ! {
        info!(
            interval_ms = self.transaction_frequency.as_millis() as u64,
            "transaction generator running"
        );
        let mut rng = rand::thread_rng();
        loop {
            self.append(rng.gen_range(1..=100000), rng.gen_range(1..=100000));
            thread::sleep(self.transaction_frequency);
        }
    }

    /// Append a transaction with the next dense id. Split out of the
    /// generator loop so tests can fill a pool directly.
    pub fn append(&self, input: u32, output: u32) -> u64 {
        let mut entries = self.lock_entries();
        let id = entries.len() as u64;
        entries.push(Some(Transaction::new(id, input, output)));
        id
    }

    /// Next live transaction at or after `cursor`, advancing the cursor
    /// past it. Returns `None` when nothing new has been generated yet.
    pub fn receive(&self, cursor: &mut usize) -> Option<Transaction> {
        let entries = self.lock_entries();
        let mut index = *cursor;
        while index < entries.len() {
            if let Some(tx) = &entries[index] {
                *cursor = index + 1;
                return Some(tx.clone());
            }
            index += 1;
        }
        *cursor = index;
        None
    }

    /// Claim a random unclaimed transaction for mining, blocking until one
    /// exists. Marks it collected so no other miner picks it up.
    pub fn claim_random(&self) -> Transaction {
        let mut rng = rand::thread_rng();
        loop {
            {
                let mut entries = self.lock_entries();
                if !entries.is_empty() {
                    let index = rng.gen_range(0..entries.len());
                    if let Some(tx) = &mut entries[index] {
                        if !tx.collected {
                            tx.collected = true;
                            return tx.clone();
                        }
                    }
                }
            }
            // empty pool or a losing draw; back off before retrying
            thread::sleep(self.transaction_frequency.min(Duration::from_millis(100)));
        }
    }

    /// Hand a claimed transaction back so other miners can take it, e.g.
    /// when a competing block preempted the round that held it.
    pub fn release(&self, id: u64) {
        let mut entries = self.lock_entries();
        if let Some(Some(tx)) = entries.get_mut(id as usize) {
            tx.collected = false;
        }
    }

    /// Count a confirmation for each id. An entry that reaches the
    /// required count is stamped, written to the CSV sink, published to
    /// the recent ring and evicted.
    pub fn confirm(&self, transaction_ids: &[u64]) {
        for &id in transaction_ids {
            let mut entries = self.lock_entries();
            let Some(slot) = entries.get_mut(id as usize) else {
                continue;
            };
            let Some(tx) = slot.as_mut() else {
                // another node already retired this one
                continue;
            };
            tx.confirmations += 1;
            if tx.confirmations < self.confirmations_required {
                continue;
            }
            tx.confirmation_time = now_millis();
            debug!(
                id,
                latency_ms = tx.confirmation_time.saturating_sub(tx.creation_time),
                "transaction confirmed"
            );
            // fixed order where lock pairs are held: pool, then sink; pool,
            // then ring
            self.sink.record(tx.creation_time, tx.confirmation_time);
            let confirmed = ConfirmedTransaction {
                id: tx.id,
                creation_time: tx.creation_time,
                confirmation_time: tx.confirmation_time,
            };
            if let Ok(mut recent) = self.recent.lock() {
                if recent.len() == self.transactions_to_show {
                    recent.remove(0);
                }
                recent.push(confirmed);
            }
            *slot = None;
        }
    }

    /// Snapshot of the recent-confirmations ring, oldest first.
    pub fn recent_confirmations(&self) -> Vec<ConfirmedTransaction> {
        self.recent.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Total transactions ever generated (including evicted ones).
    pub fn generated(&self) -> usize {
        self.lock_entries().len()
    }

    /// Transactions still awaiting confirmation.
    pub fn live(&self) -> usize {
        self.lock_entries().iter().filter(|e| e.is_some()).count()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<Option<Transaction>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
