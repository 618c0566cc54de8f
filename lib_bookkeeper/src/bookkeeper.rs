// A dBFT bookkeeper. Consensus proceeds in rounds of views: each view has
// one speaker (by rotation, or drawn from a seeded RNG) that proposes a
// block, while the delegates validate the proposal and vote. A strict
// two-thirds supermajority either way settles the view; anything else
// (timeout, split vote, dead speaker) moves every honest node to the next
// view with its exponentially larger time budget. Finality is absolute:
// once published, a block is never reorganised away.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use lib_chain::block::DbftBlock;
use lib_chain::digest::now_millis;
use lib_chain::transaction::Transaction;
use lib_network::bus::{DbftKind, DbftMessage, MessageBus};
use lib_network::shared::{ConsensusSlots, Proposal};
use lib_tx_pool::pool::TxPool;

/// Tunables of a dBFT run.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DbftConfig {
    /// Number of bookkeepers (and worker threads).
    pub nodes: usize,
    /// Transactions per block.
    pub block_size: usize,
    /// Seconds a speaker listens for transactions before proposing. Large
    /// compared to the time consensus itself takes.
    pub block_time: u64,
    /// Seconds between generated transactions.
    pub transaction_frequency: f64,
    /// Nodes that never take part at all.
    pub unresponsive_nodes: usize,
    /// Nodes that propose garbage as speaker and invert their votes as
    /// delegates.
    pub malicious_nodes: usize,
    /// Draw the speaker from an RNG seeded by (height, view) instead of
    /// rotating.
    pub random_speaker: bool,
    /// Recently confirmed transactions kept for display.
    pub transactions_to_show: usize,
}

fn default_nodes() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .saturating_sub(2)
        .max(1)
}

impl Default for DbftConfig {
    fn default() -> DbftConfig {
        DbftConfig {
            nodes: default_nodes(),
            block_size: 5,
            block_time: 4,
            transaction_frequency: 0.2,
            unresponsive_nodes: 0,
            malicious_nodes: 1,
            random_speaker: false,
            transactions_to_show: 20,
        }
    }
}

/// Deterministic speaker for `(height, view)`. Every node computes the
/// same answer without sharing an RNG.
pub fn speaker_index(height: usize, view: usize, nodes: usize, random_speaker: bool) -> usize {
    if random_speaker {
        let mut rng = StdRng::seed_from_u64((height + view) as u64);
        rng.gen_range(0..nodes)
    } else {
        (height as i64 - view as i64).rem_euclid(nodes as i64) as usize
    }
}

/// What the dashboard sees of a bookkeeper.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BookkeeperStatus {
    pub id: usize,
    pub height: usize,
    pub tip_hash: String,
    pub activity: String,
    pub view: usize,
    pub speaker: bool,
    pub responsive: bool,
    pub honest: bool,
}

/// One consensus node. `run` loops over rounds until the process dies;
/// an unresponsive node exits immediately and lets the others cope.
pub struct Bookkeeper {
    id: usize,
    config: DbftConfig,
    pool: Arc<TxPool>,
    bus: Arc<MessageBus<DbftMessage>>,
    slots: Arc<ConsensusSlots>,
    chain: Vec<DbftBlock>,
    /// Index of the chain tip; the round in progress decides the block at
    /// `height + 1`.
    height: usize,
    view: usize,
    view_start: u64,
    speaker: bool,
    responsive: bool,
    honest: bool,
    /// Local copies of pool transactions gathered during wait phases,
    /// keyed by id. The speaker samples its proposals from here.
    memory: BTreeMap<u64, Transaction>,
    /// Pool scan position, carried across rounds.
    tx_cursor: usize,
    status: Arc<Mutex<BookkeeperStatus>>,
}

impl Bookkeeper {
    pub fn new(
        id: usize,
        config: DbftConfig,
        pool: Arc<TxPool>,
        bus: Arc<MessageBus<DbftMessage>>,
        slots: Arc<ConsensusSlots>,
        responsive: bool,
        honest: bool,
    ) -> Bookkeeper {
        let status = Arc::new(Mutex::new(BookkeeperStatus {
            id,
            responsive,
            honest,
            ..BookkeeperStatus::default()
        }));
        Bookkeeper {
            id,
            config,
            pool,
            bus,
            slots,
            chain: Vec::new(),
            height: 0,
            view: 0,
            view_start: 0,
            speaker: false,
            responsive,
            honest,
            memory: BTreeMap::new(),
            tx_cursor: 0,
            status,
        }
    }

    /// Handle for the dashboard.
    pub fn status(&self) -> Arc<Mutex<BookkeeperStatus>> {
        Arc::clone(&self.status)
    }

    pub fn run(mut self) {
        self.chain.push(DbftBlock::genesis());
        self.publish_status();
        if !self.responsive {
            self.set_activity("IDLE");
            return;
        }
        info!(node = self.id, honest = self.honest, "bookkeeper started");
        loop {
            self.round();
        }
    }

    /// One block of consensus: loop views until some view reaches quorum.
    fn round(&mut self) {
        self.view = 0;
        loop {
            self.view_start = now_millis();
            self.speaker = self.select_speaker();
            self.publish_status();

            self.wait();
            if self.speaker {
                self.propose_block();
            } else if !self.timed_out() {
                self.validate_proposal();
            }

            if self.listen_for_responses() {
                break;
            }
            self.view += 1;
            debug!(node = self.id, height = self.height, view = self.view, "view change");
        }
    }

    fn select_speaker(&self) -> bool {
        speaker_index(
            self.height,
            self.view,
            self.config.nodes,
            self.config.random_speaker,
        ) == self.id
    }

    /// The wait phase. The speaker soaks up transactions for the full
    /// block time; a delegate does the same until a message for the
    /// current (height, view) arrives or the view times out.
    fn wait(&mut self) {
        self.set_activity("MONITORING NETWORK");
        if self.speaker {
            let until = now_millis() + self.config.block_time * 1000;
            while now_millis() < until {
                self.absorb_transaction();
            }
        } else {
            loop {
                if !self.bus.is_empty(self.id) && self.filter_message() {
                    break;
                }
                if self.timed_out() {
                    break;
                }
                self.absorb_transaction();
            }
        }
    }

    fn absorb_transaction(&mut self) {
        if let Some(tx) = self.pool.receive(&mut self.tx_cursor) {
            self.memory.insert(tx.id, tx);
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// True if the head of the queue belongs to the current round.
    /// Messages from nodes still working on an older height or view are
    /// deleted without reply.
    fn filter_message(&mut self) -> bool {
        let Some(message) = self.bus.peek_front(self.id) else {
            return false;
        };
        if message.height < self.height
            || (message.height == self.height && message.view < self.view)
        {
            self.bus.pop_front(self.id);
            return false;
        }
        true
    }

    /// True once the view has used up its exponential time budget.
    fn timed_out(&self) -> bool {
        let budget = 1u64
            .checked_shl(self.view as u32 + 1)
            .unwrap_or(u64::MAX)
            .saturating_mul(self.config.block_time * 1000);
        now_millis().saturating_sub(self.view_start) > budget
    }

    /// The speaker samples a block's worth of distinct transactions from
    /// its memory, writes the proposal to the shared slot and announces
    /// it. A malicious speaker publishes an empty hash that no delegate
    /// can reproduce.
    fn propose_block(&mut self) {
        self.set_activity("PUBLISHING PROPOSAL");
        let transactions = self.sample_transactions();
        let hash = if self.honest {
            DbftBlock::new(self.tip_hash(), &transactions).hash
        } else {
            String::new()
        };
        debug!(
            node = self.id,
            height = self.height,
            view = self.view,
            transactions = transactions.len(),
            "proposing block"
        );
        if let Ok(mut proposal) = self.slots.proposal.lock() {
            *proposal = Proposal { transactions, hash };
        }
        self.broadcast(DbftKind::PrepareRequest);
    }

    /// Random draws from memory, duplicates skipped rather than redrawn,
    /// so a proposal may run short when memory is thin.
    fn sample_transactions(&mut self) -> Vec<Transaction> {
        let mut rng = rand::thread_rng();
        let mut picked: Vec<Transaction> = Vec::new();
        if self.memory.is_empty() {
            return picked;
        }
        for _ in 0..self.config.block_size {
            let index = rng.gen_range(0..self.memory.len());
            if let Some(tx) = self.memory.values().nth(index) {
                if !picked.iter().any(|p| p.id == tx.id) {
                    picked.push(tx.clone());
                }
            }
        }
        picked
    }

    /// A delegate checks the proposal against its own tip: rebuilding the
    /// block from the proposed transactions must reproduce the proposed
    /// hash. Honest delegates vote what they verified; malicious ones
    /// vote the opposite. The prepare request itself stays queued, where
    /// the collection phase will count it as the speaker's approval.
    fn validate_proposal(&mut self) {
        self.set_activity("VALIDATING PROPOSAL");
        let approved = match self.bus.peek_front(self.id) {
            Some(message) if message.kind == DbftKind::PrepareRequest => {
                match self.slots.proposal.lock() {
                    Ok(proposal) => {
                        DbftBlock::new(self.tip_hash(), &proposal.transactions).hash
                            == proposal.hash
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        };
        let vote = if approved == self.honest {
            DbftKind::PrepareResponse
        } else {
            DbftKind::ChangeView
        };
        self.broadcast(vote);
    }

    /// Count votes for the current (height, view) until one side clears
    /// the strict two-thirds bar, the voters are exhausted, a published
    /// block arrives, or the view times out. Each sender is counted at
    /// most once per direction, though nothing stops an approver from
    /// later also requesting a view change; progression still needs a
    /// supermajority, so safety holds.
    fn listen_for_responses(&mut self) -> bool {
        self.set_activity("RECEIVING RESPONSES");
        let nodes = self.config.nodes;
        let supermajority = 2.0 / 3.0 * nodes as f64;
        let mut approvals = 0usize;
        let mut rejections = 0usize;
        let mut approved = vec![false; nodes];
        let mut rejected = vec![false; nodes];

        while approvals + rejections < nodes {
            let Some(message) = self.bus.peek_front(self.id) else {
                if self.timed_out() {
                    self.broadcast(DbftKind::ChangeView);
                    return false;
                }
                thread::sleep(Duration::from_millis(1));
                continue;
            };

            if message.height == self.height && message.view == self.view {
                match message.kind {
                    DbftKind::PrepareRequest | DbftKind::PrepareResponse => {
                        if !approved[message.node] {
                            approved[message.node] = true;
                            approvals += 1;
                        }
                    }
                    DbftKind::ChangeView => {
                        if !rejected[message.node] {
                            rejected[message.node] = true;
                            rejections += 1;
                        }
                    }
                    DbftKind::BlockPublished => {
                        self.bus.pop_front(self.id);
                        self.add_block();
                        return true;
                    }
                }
            }
            // consumed either way; stale and foreign-view messages die here
            self.bus.pop_front(self.id);

            if approvals as f64 > supermajority {
                self.publish_full_block();
                return true;
            }
            if rejections as f64 > supermajority {
                return false;
            }
        }
        false
    }

    /// The first node to see quorum materialises the full block into the
    /// shared slot and tells everyone; later arrivals find their proposal
    /// already published and just append.
    fn publish_full_block(&mut self) {
        self.set_activity("PUBLISHING BLOCK");
        let proposal = match self.slots.proposal.lock() {
            Ok(proposal) => proposal.clone(),
            Err(_) => return,
        };
        let first_to_publish = match self.slots.published.lock() {
            Ok(mut published) => {
                if published.hash != proposal.hash {
                    *published = DbftBlock::new(self.tip_hash(), &proposal.transactions);
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        };
        if first_to_publish {
            info!(
                node = self.id,
                height = self.height + 1,
                view = self.view,
                "block published"
            );
            self.broadcast(DbftKind::BlockPublished);
        }
        self.add_block();
    }

    /// Append the published block. Only the speaker notifies the pool:
    /// finality means one confirmation call is enough. Every node drops
    /// the block's transactions from its local memory.
    fn add_block(&mut self) {
        self.set_activity("ADDING BLOCK");
        let Ok(block) = self.slots.published.lock().map(|b| (*b).clone()) else {
            return;
        };
        self.height += 1;
        self.chain.push(block);

        let confirmed_ids: Vec<u64> = match self.slots.proposal.lock() {
            Ok(proposal) => proposal.transactions.iter().map(|tx| tx.id).collect(),
            Err(_) => Vec::new(),
        };
        if self.speaker {
            self.pool.confirm(&confirmed_ids);
        }
        for id in &confirmed_ids {
            self.memory.remove(id);
        }
        self.publish_status();
    }

    /// Send to every queue, own included; a node's own vote counts like
    /// any other. The bus lock is taken per push.
    fn broadcast(&mut self, kind: DbftKind) {
        self.set_activity("BROADCASTING MESSAGE");
        let message = DbftMessage {
            kind,
            height: self.height,
            view: self.view,
            node: self.id,
        };
        for target in 0..self.config.nodes {
            self.bus.push(target, message);
        }
    }

    fn tip_hash(&self) -> String {
        self.chain
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_default()
    }

    fn set_activity(&self, activity: &str) {
        if let Ok(mut status) = self.status.lock() {
            status.activity = activity.to_string();
        }
    }

    fn publish_status(&self) {
        if let Ok(mut status) = self.status.lock() {
            status.height = self.height;
            status.tip_hash = self.tip_hash();
            status.view = self.view;
            status.speaker = self.speaker;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_tx_pool::telemetry::CsvSink;

    fn test_config(nodes: usize) -> DbftConfig {
        DbftConfig {
            nodes,
            block_size: 2,
            block_time: 4,
            transaction_frequency: 0.001,
            unresponsive_nodes: 0,
            malicious_nodes: 0,
            ..DbftConfig::default()
        }
    }

    struct Council {
        pool: Arc<TxPool>,
        bus: Arc<MessageBus<DbftMessage>>,
        slots: Arc<ConsensusSlots>,
    }

    impl Council {
        fn new() -> Council {
            Council {
                pool: Arc::new(TxPool::new(
                    1,
                    20,
                    Duration::from_millis(1),
                    CsvSink::disabled(),
                )),
                bus: Arc::new(MessageBus::new(4)),
                slots: Arc::new(ConsensusSlots::new()),
            }
        }

        fn node(&self, id: usize, honest: bool) -> Bookkeeper {
            let mut bookkeeper = Bookkeeper::new(
                id,
                test_config(4),
                Arc::clone(&self.pool),
                Arc::clone(&self.bus),
                Arc::clone(&self.slots),
                true,
                honest,
            );
            bookkeeper.chain.push(DbftBlock::genesis());
            bookkeeper.view_start = now_millis();
            bookkeeper
        }

        fn stage(&self, target: usize, kind: DbftKind, height: usize, view: usize, node: usize) {
            self.bus.push(
                target,
                DbftMessage {
                    kind,
                    height,
                    view,
                    node,
                },
            );
        }
    }

    #[test]
    fn rotational_speaker_walks_backwards_through_views() {
        assert_eq!(speaker_index(5, 0, 4, false), 1);
        assert_eq!(speaker_index(5, 1, 4, false), 0);
        assert_eq!(speaker_index(0, 1, 4, false), 3);
        assert_eq!(speaker_index(0, 9, 4, false), 3);
    }

    #[test]
    fn random_speaker_is_deterministic_and_in_range() {
        for height in 0..8 {
            for view in 0..4 {
                let a = speaker_index(height, view, 4, true);
                let b = speaker_index(height, view, 4, true);
                assert_eq!(a, b);
                assert!(a < 4);
            }
        }
    }

    #[test]
    fn stale_messages_are_deleted_by_the_filter() {
        let council = Council::new();
        let mut node = council.node(0, true);
        node.height = 2;
        node.view = 1;

        council.stage(0, DbftKind::PrepareResponse, 1, 0, 3);
        assert!(!node.filter_message());
        assert_eq!(council.bus.len(0), 0, "stale message is gone");

        council.stage(0, DbftKind::PrepareRequest, 2, 1, 3);
        assert!(node.filter_message());
        assert_eq!(council.bus.len(0), 1, "current message stays queued");
    }

    #[test]
    fn view_timeout_budget_doubles_per_view() {
        let council = Council::new();
        let mut node = council.node(0, true);

        node.view = 0;
        node.view_start = now_millis().saturating_sub(7_000);
        assert!(!node.timed_out(), "7s is inside the 8s budget of view 0");
        node.view_start = now_millis().saturating_sub(9_000);
        assert!(node.timed_out());

        node.view = 1;
        assert!(!node.timed_out(), "view 1 stretches the budget to 16s");
        node.view_start = now_millis().saturating_sub(17_000);
        assert!(node.timed_out());
    }

    #[test]
    fn supermajority_of_approvals_publishes_and_appends() {
        let council = Council::new();
        let mut node = council.node(0, true);

        let txs = vec![Transaction::new(0, 5, 6)];
        let genesis_hash = node.tip_hash();
        let expected = DbftBlock::new(genesis_hash, &txs);
        *council.slots.proposal.lock().unwrap() = Proposal {
            transactions: txs,
            hash: expected.hash.clone(),
        };

        council.stage(0, DbftKind::PrepareRequest, 0, 0, 1);
        council.stage(0, DbftKind::PrepareResponse, 0, 0, 2);
        council.stage(0, DbftKind::PrepareResponse, 0, 0, 3);

        assert!(node.listen_for_responses());
        assert_eq!(node.height, 1);
        assert_eq!(node.chain.len(), 2);
        assert_eq!(node.chain[1].hash, expected.hash);

        // the publisher told every council member
        for target in 0..4 {
            assert!(council
                .bus
                .snapshot(target)
                .iter()
                .any(|m| m.kind == DbftKind::BlockPublished && m.node == 0));
        }
    }

    #[test]
    fn duplicate_votes_from_one_sender_count_once() {
        let council = Council::new();
        let mut node = council.node(0, true);

        for _ in 0..4 {
            council.stage(0, DbftKind::PrepareResponse, 0, 0, 1);
        }
        council.stage(0, DbftKind::ChangeView, 0, 0, 2);
        council.stage(0, DbftKind::ChangeView, 0, 0, 3);
        council.stage(0, DbftKind::ChangeView, 0, 0, 0);

        // one approval plus three rejections: the rejection side clears
        // the bar first
        assert!(!node.listen_for_responses());
        assert_eq!(node.height, 0, "no block appended on a failed view");
    }

    #[test]
    fn supermajority_of_rejections_ends_the_view() {
        let council = Council::new();
        let mut node = council.node(0, true);

        council.stage(0, DbftKind::ChangeView, 0, 0, 1);
        council.stage(0, DbftKind::ChangeView, 0, 0, 2);
        council.stage(0, DbftKind::ChangeView, 0, 0, 3);

        assert!(!node.listen_for_responses());
        assert_eq!(node.chain.len(), 1);
    }

    #[test]
    fn published_block_is_adopted_mid_collection() {
        let council = Council::new();
        let mut node = council.node(0, true);

        let txs = vec![Transaction::new(0, 5, 6)];
        let block = DbftBlock::new(node.tip_hash(), &txs);
        *council.slots.proposal.lock().unwrap() = Proposal {
            transactions: txs,
            hash: block.hash.clone(),
        };
        *council.slots.published.lock().unwrap() = block.clone();

        council.stage(0, DbftKind::BlockPublished, 0, 0, 2);

        assert!(node.listen_for_responses());
        assert_eq!(node.chain[1].hash, block.hash);
    }

    #[test]
    fn foreign_round_messages_are_consumed_without_counting() {
        let council = Council::new();
        let mut node = council.node(0, true);

        let txs = vec![Transaction::new(0, 5, 6)];
        let expected = DbftBlock::new(node.tip_hash(), &txs);
        *council.slots.proposal.lock().unwrap() = Proposal {
            transactions: txs,
            hash: expected.hash.clone(),
        };

        // three stale rejections from an older height, then real quorum
        for sender in 0..3 {
            council.stage(0, DbftKind::ChangeView, 0, 0, sender);
        }
        node.height = 1;
        node.chain.push(expected.clone());
        let txs2 = vec![Transaction::new(1, 7, 8)];
        let next = DbftBlock::new(node.tip_hash(), &txs2);
        *council.slots.proposal.lock().unwrap() = Proposal {
            transactions: txs2,
            hash: next.hash.clone(),
        };
        council.stage(0, DbftKind::PrepareRequest, 1, 0, 1);
        council.stage(0, DbftKind::PrepareResponse, 1, 0, 2);
        council.stage(0, DbftKind::PrepareResponse, 1, 0, 3);

        assert!(node.listen_for_responses());
        assert_eq!(node.height, 2);
    }

    #[test]
    fn honest_delegate_approves_a_valid_proposal() {
        let council = Council::new();
        let mut speaker = council.node(0, true);
        let mut delegate = council.node(1, true);

        for _ in 0..3 {
            council.pool.append(5, 6);
        }
        let mut cursor = 0;
        while let Some(tx) = council.pool.receive(&mut cursor) {
            speaker.memory.insert(tx.id, tx);
        }

        speaker.speaker = true;
        speaker.propose_block();
        assert!(!council.slots.proposal.lock().unwrap().hash.is_empty());

        delegate.validate_proposal();
        assert!(council
            .bus
            .snapshot(0)
            .iter()
            .any(|m| m.kind == DbftKind::PrepareResponse && m.node == 1));
    }

    #[test]
    fn malicious_speaker_is_rejected_by_honest_delegates() {
        let council = Council::new();
        let mut speaker = council.node(0, false);
        let mut delegate = council.node(1, true);

        council.pool.append(5, 6);
        let mut cursor = 0;
        while let Some(tx) = council.pool.receive(&mut cursor) {
            speaker.memory.insert(tx.id, tx);
        }

        speaker.speaker = true;
        speaker.propose_block();
        assert!(council.slots.proposal.lock().unwrap().hash.is_empty());

        delegate.validate_proposal();
        assert!(council
            .bus
            .snapshot(2)
            .iter()
            .any(|m| m.kind == DbftKind::ChangeView && m.node == 1));
    }

    #[test]
    fn malicious_delegate_inverts_its_vote() {
        let council = Council::new();
        let mut speaker = council.node(0, true);
        let mut turncoat = council.node(1, false);

        council.pool.append(5, 6);
        let mut cursor = 0;
        while let Some(tx) = council.pool.receive(&mut cursor) {
            speaker.memory.insert(tx.id, tx);
        }

        speaker.speaker = true;
        speaker.propose_block();
        turncoat.validate_proposal();
        assert!(council
            .bus
            .snapshot(3)
            .iter()
            .any(|m| m.kind == DbftKind::ChangeView && m.node == 1));
    }

    #[test]
    fn the_speaker_alone_confirms_with_the_pool() {
        let council = Council::new();
        let mut speaker = council.node(0, true);

        let id = council.pool.append(5, 6);
        let mut cursor = 0;
        let tx = council.pool.receive(&mut cursor).unwrap();
        speaker.memory.insert(tx.id, tx.clone());

        let block = DbftBlock::new(speaker.tip_hash(), &[tx.clone()]);
        *council.slots.proposal.lock().unwrap() = Proposal {
            transactions: vec![tx],
            hash: block.hash.clone(),
        };
        speaker.speaker = true;

        council.stage(0, DbftKind::PrepareRequest, 0, 0, 0);
        council.stage(0, DbftKind::PrepareResponse, 0, 0, 2);
        council.stage(0, DbftKind::PrepareResponse, 0, 0, 3);

        assert!(speaker.listen_for_responses());
        assert_eq!(council.pool.live(), 0, "speaker retires the transactions");
        assert!(
            !speaker.memory.contains_key(&id),
            "appended transactions leave local memory"
        );
    }

    #[test]
    fn unresponsive_nodes_exit_without_consensus() {
        let council = Council::new();
        let node = Bookkeeper::new(
            2,
            test_config(4),
            Arc::clone(&council.pool),
            Arc::clone(&council.bus),
            Arc::clone(&council.slots),
            false,
            true,
        );
        let status = node.status();
        node.run();
        let status = status.lock().unwrap();
        assert_eq!(status.activity, "IDLE");
        assert_eq!(status.height, 0);
    }
}
