// A proof-of-work mining node. Each miner keeps its own copy of the chain,
// grinds nonces until interrupted by a message, gossips found blocks over
// the bus, and heals forks by walking a peer's chain back to the common
// ancestor. Miners never compare total work; the first block seen at a
// height wins and a later competitor is only adopted through
// synchronization against a longer chain.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lib_chain::block::{PowBlock, GENESIS_PREVIOUS_HASH};
use lib_chain::digest::now_millis;
use lib_chain::transaction::Transaction;
use lib_network::bus::{MessageBus, PowMessage};
use lib_network::shared::BlockStore;
use lib_tx_pool::pool::TxPool;

/// Tunables of a proof-of-work run. Loaded from JSON when a config file is
/// given; every field falls back to the default below.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PowConfig {
    /// Number of mining nodes (and worker threads).
    pub nodes: usize,
    /// Transactions per block.
    pub block_size: usize,
    /// Targeted average seconds between blocks.
    pub block_time: u64,
    /// Leading-zero requirement at genesis.
    pub initial_difficulty: u32,
    /// Blocks between difficulty recalculations.
    pub adjustment_frequency: usize,
    /// Seconds between generated transactions.
    pub transaction_frequency: f64,
    /// Blocks on top of a transaction before it counts as confirmed.
    pub confirmation_depth: usize,
    /// Percentage shortfall from the expected chain length that makes a
    /// node suspect it is partitioned.
    pub synchronization_threshold: u32,
    /// Blocks between partition checks.
    pub synchronization_frequency: usize,
    /// Recently confirmed transactions kept for display.
    pub transactions_to_show: usize,
    /// If true each difficulty step is one leading zero bit instead of
    /// four (hex characters up to '7' pass).
    pub binary_hash: bool,
}

/// Worker threads default to the spare cores: display and transaction
/// generation each need one for themselves.
pub fn default_nodes() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .saturating_sub(2)
        .max(1)
}

impl Default for PowConfig {
    fn default() -> PowConfig {
        PowConfig {
            nodes: default_nodes(),
            block_size: 5,
            block_time: 10,
            initial_difficulty: 2,
            adjustment_frequency: 20,
            transaction_frequency: 0.1,
            confirmation_depth: 5,
            synchronization_threshold: 30,
            synchronization_frequency: 20,
            transactions_to_show: 20,
            binary_hash: false,
        }
    }
}

/// What the dashboard sees of a miner. The owning thread refreshes it, the
/// renderer only reads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MinerStatus {
    pub id: usize,
    pub height: usize,
    pub tip_hash: String,
    pub activity: String,
    pub difficulty: u32,
}

/// A mining node. `run` never returns; the node mines, publishes and
/// synchronizes until the process is killed.
pub struct Miner {
    id: usize,
    config: PowConfig,
    pool: Arc<TxPool>,
    bus: Arc<MessageBus<PowMessage>>,
    store: Arc<BlockStore>,
    chain: Vec<PowBlock>,
    difficulty: u32,
    status: Arc<Mutex<MinerStatus>>,
}

impl Miner {
    pub fn new(
        id: usize,
        config: PowConfig,
        pool: Arc<TxPool>,
        bus: Arc<MessageBus<PowMessage>>,
        store: Arc<BlockStore>,
    ) -> Miner {
        let difficulty = config.initial_difficulty;
        let status = Arc::new(Mutex::new(MinerStatus {
            id,
            difficulty,
            ..MinerStatus::default()
        }));
        Miner {
            id,
            config,
            pool,
            bus,
            store,
            chain: Vec::new(),
            difficulty,
            status,
        }
    }

    /// Handle for the dashboard.
    pub fn status(&self) -> Arc<Mutex<MinerStatus>> {
        Arc::clone(&self.status)
    }

    pub fn run(mut self) -> ! {
        self.set_activity("MINING");
        self.chain
            .push(PowBlock::genesis(self.difficulty, self.config.binary_hash));
        self.publish_status();
        info!(node = self.id, "miner started, genesis mined");

        loop {
            self.mine();
            self.handle_next_message();
        }
    }

    /// Mine rounds until a message preempts the nonce search. Each round
    /// claims a block's worth of transactions, grinds the candidate and on
    /// success appends and gossips it, then starts the next round.
    fn mine(&mut self) {
        'rounds: loop {
            let transactions = self.collect_transactions();
            self.set_activity("MINING");

            let previous_hash = self.tip_hash();
            let mut candidate =
                PowBlock::candidate(previous_hash, &transactions, self.difficulty);

            loop {
                if !self.bus.is_empty(self.id) {
                    self.release_transactions(&transactions);
                    return;
                }
                if candidate.try_nonce(self.config.binary_hash) {
                    let height = self.chain.len();
                    info!(
                        node = self.id,
                        height,
                        nonce = candidate.nonce,
                        difficulty = candidate.difficulty,
                        "block mined"
                    );
                    self.add_block(candidate, height);
                    self.notify_network();
                    continue 'rounds;
                }
            }
        }
    }

    /// Claim transactions from the pool until a block's worth is held.
    fn collect_transactions(&mut self) -> Vec<Transaction> {
        self.set_activity("GETTING TRANSACTIONS");
        let mut transactions = Vec::with_capacity(self.config.block_size);
        while transactions.len() < self.config.block_size {
            transactions.push(self.pool.claim_random());
        }
        transactions
    }

    /// Hand claimed transactions back after a lost race.
    fn release_transactions(&mut self, transactions: &[Transaction]) {
        self.set_activity("DROPPING TRANSACTIONS");
        for tx in transactions.iter().rev() {
            self.pool.release(tx.id);
        }
    }

    /// Append `block` at `height`, overwriting a fork block if one is
    /// already there, then run the bookkeeping that hangs off a growing
    /// chain: confirmation emission, difficulty adjustment and the
    /// periodic partition check.
    fn add_block(&mut self, block: PowBlock, height: usize) {
        self.set_activity("ADDING BLOCK");
        if height == self.chain.len() {
            self.chain.push(block);
        } else if height < self.chain.len() {
            self.chain[height] = block;
        } else {
            return;
        }

        let depth = self.chain.len();
        if depth > self.config.confirmation_depth {
            let buried = &self.chain[depth - self.config.confirmation_depth];
            let ids = buried.merkle.transaction_ids.clone();
            self.pool.confirm(&ids);
        }

        if height % self.config.adjustment_frequency == 0 {
            self.adjust_difficulty();
        }
        if height % self.config.synchronization_frequency == 0 {
            self.check_partition(self.id + 1);
        }
        self.publish_status();
    }

    /// Gossip the new tip. The bus lock is taken per peer, not across the
    /// whole loop, so peers may act on the news at different times; that
    /// window is where forks come from.
    fn notify_network(&mut self) {
        self.set_activity("PUBLISHING BLOCK");
        let height = self.chain.len() - 1;
        for peer in 0..self.config.nodes {
            if peer == self.id {
                continue;
            }
            self.bus.push(
                peer,
                PowMessage::BlockFound {
                    node: self.id,
                    height,
                },
            );
        }
    }

    /// Consume the message that interrupted mining.
    fn handle_next_message(&mut self) {
        match self.bus.pop_front(self.id) {
            Some(PowMessage::BlockFound { node, height }) => self.synchronize(node, height),
            Some(PowMessage::RequestBlock { node, height }) => self.send_block(node, height),
            // a BlockSent or BlockUnavailable left over from an abandoned
            // synchronization; nothing waits for it any more
            Some(_) => {}
            None => {}
        }
    }

    fn request_block(&mut self, from: usize, height: usize) {
        self.set_activity("REQUESTING BLOCK");
        self.bus.push(
            from,
            PowMessage::RequestBlock {
                node: self.id,
                height,
            },
        );
    }

    /// Answer a peer's request: share the block through the store, or
    /// admit the chain does not reach that height.
    fn send_block(&mut self, requester: usize, height: usize) {
        self.set_activity("SENDING BLOCK");
        if height >= self.chain.len() {
            self.bus.push(requester, PowMessage::BlockUnavailable);
            return;
        }
        let slot = self.store.insert(self.chain[height].clone());
        self.bus.push(requester, PowMessage::BlockSent { slot, height });
    }

    /// Validate the shared block against the local parent and splice it in
    /// at `height`. Invalid blocks are dropped without comment to the
    /// sender.
    fn receive_block(&mut self, slot: usize, height: usize) {
        self.set_activity("VALIDATING BLOCK");
        let Some(block) = self.store.remove(slot) else {
            return;
        };
        if height > self.chain.len() {
            return;
        }
        let previous_hash = if height == 0 {
            GENESIS_PREVIOUS_HASH.to_string()
        } else {
            self.chain[height - 1].hash.clone()
        };
        match block.verify(&previous_hash, self.config.binary_hash) {
            Ok(()) => self.add_block(block, height),
            Err(err) => debug!(node = self.id, height, %err, "dropping invalid block"),
        }
    }

    /// Nodes with the same chain independently compute the same difficulty
    /// from the trailing inter-block times.
    fn adjust_difficulty(&mut self) {
        self.set_activity("CALCULATING DIFFICULTY");
        let len = self.chain.len();
        let window = self.config.adjustment_frequency;
        if len < window + 1 {
            return;
        }

        let mut average = 0.0;
        for i in 1..window {
            average +=
                self.chain[len - i].timestamp as f64 - self.chain[len - i - 1].timestamp as f64;
        }
        average /= (window - 1) as f64 * 1000.0;

        let tip_difficulty = self.chain[len - 1].difficulty;
        self.difficulty = if average < self.config.block_time as f64 {
            tip_difficulty + 1
        } else {
            tip_difficulty.saturating_sub(1)
        };
        debug!(
            node = self.id,
            average_seconds = average,
            difficulty = self.difficulty,
            "difficulty adjusted"
        );
    }

    /// How long the chain should at least be, given the genesis age, the
    /// target block time and the tolerated shortfall.
    fn expected_minimum_height(&self, now: u64) -> usize {
        let genesis_time = self.chain.first().map(|b| b.timestamp).unwrap_or(now);
        let age_seconds = now.saturating_sub(genesis_time) as f64 / 1000.0;
        let tolerated = (100 - self.config.synchronization_threshold) as f64 / 100.0;
        (tolerated * (age_seconds / self.config.block_time as f64)).floor() as usize
    }

    /// A chain much shorter than the expected length means this node sat
    /// in a partition. Synchronizing with any live peer pulls it back into
    /// the majority part of the network, if one exists.
    fn check_partition(&mut self, neighbour: usize) {
        self.set_activity("CHECKING PARTITION");
        if self.config.nodes < 2 {
            return;
        }
        let neighbour = neighbour % self.config.nodes;
        if neighbour == self.id {
            // asked every peer already
            return;
        }
        let expected = self.expected_minimum_height(now_millis());
        if self.chain.len() < expected {
            warn!(
                node = self.id,
                height = self.chain.len(),
                expected,
                neighbour,
                "chain shorter than expected, synchronizing"
            );
            self.synchronize(neighbour, expected);
        }
    }

    /// Pull blocks from `node`, walking down from `height` until a block
    /// links onto the local chain, then apply the collected suffix in
    /// order. Abandons the peer (and tries the next) if it reports the
    /// height unavailable; gives up entirely if the walk passes genesis.
    fn synchronize(&mut self, node: usize, height: usize) {
        self.set_activity("SYNCHRONIZING");
        if height < self.chain.len() {
            return;
        }
        debug!(node = self.id, peer = node, height, "synchronizing");

        let mut height = height;
        let mut slots: Vec<usize> = Vec::new();
        loop {
            self.request_block(node, height);

            let slot = match self.await_block_reply(node) {
                Some(slot) => slot,
                // peer cannot help; try the next one
                None => return,
            };
            slots.insert(0, slot);
            let Some(block) = self.store.fetch(slot) else {
                return;
            };

            if height > 0
                && height <= self.chain.len()
                && self.chain[height - 1].hash == block.previous_hash
            {
                // common ancestor found
                break;
            }
            if height == 0 {
                // walked all the way down; the peer's genesis replaces ours
                break;
            }
            height -= 1;
        }

        for (i, &slot) in slots.iter().enumerate() {
            self.receive_block(slot, height + i);
        }
        self.publish_status();
    }

    /// Scan the queue until the peer's reply arrives. Block requests from
    /// other nodes are served along the way, block announcements are left
    /// queued for after the synchronization. Returns the share slot from
    /// `BlockSent`, or `None` after `BlockUnavailable` (having already
    /// moved the partition check on to the next peer).
    fn await_block_reply(&mut self, node: usize) -> Option<usize> {
        loop {
            let mut index = 0;
            let mut progressed = false;
            while index < self.bus.len(self.id) {
                match self.bus.get(self.id, index) {
                    Some(PowMessage::RequestBlock { node: requester, height }) => {
                        self.bus.remove_at(self.id, index);
                        self.send_block(requester, height);
                        progressed = true;
                    }
                    Some(PowMessage::BlockSent { slot, .. }) => {
                        self.bus.remove_at(self.id, index);
                        return Some(slot);
                    }
                    Some(PowMessage::BlockUnavailable) => {
                        self.bus.remove_at(self.id, index);
                        self.check_partition(node + 1);
                        return None;
                    }
                    _ => index += 1,
                }
            }
            if !progressed {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn tip_hash(&self) -> String {
        self.chain
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string())
    }

    fn set_activity(&self, activity: &str) {
        if let Ok(mut status) = self.status.lock() {
            status.activity = activity.to_string();
        }
    }

    fn publish_status(&self) {
        if let Ok(mut status) = self.status.lock() {
            status.height = self.chain.len();
            status.tip_hash = self.tip_hash();
            status.difficulty = self.difficulty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_tx_pool::telemetry::CsvSink;

    fn test_config(nodes: usize) -> PowConfig {
        PowConfig {
            nodes,
            block_size: 2,
            initial_difficulty: 0,
            transaction_frequency: 0.001,
            ..PowConfig::default()
        }
    }

    fn test_pool(nodes: usize) -> Arc<TxPool> {
        Arc::new(TxPool::new(
            nodes as u32,
            20,
            Duration::from_millis(1),
            CsvSink::disabled(),
        ))
    }

    fn test_miner(id: usize, config: PowConfig) -> Miner {
        let nodes = config.nodes;
        Miner::new(
            id,
            config,
            test_pool(nodes),
            Arc::new(MessageBus::new(nodes)),
            Arc::new(BlockStore::new()),
        )
    }

    /// Mine one block on top of the miner's current tip, appending it the
    /// way a successful round would.
    fn mine_one(miner: &mut Miner, ids: &[u64]) {
        let txs: Vec<Transaction> = ids.iter().map(|&i| Transaction::new(i, 1, 2)).collect();
        let mut candidate = PowBlock::candidate(miner.tip_hash(), &txs, miner.difficulty);
        while !candidate.try_nonce(false) {}
        let height = miner.chain.len();
        miner.add_block(candidate, height);
    }

    #[test]
    fn found_blocks_are_gossiped_to_every_peer() {
        let mut miner = test_miner(0, test_config(3));
        miner.chain.push(PowBlock::genesis(0, false));
        mine_one(&mut miner, &[1]);
        miner.notify_network();

        for peer in 1..3 {
            assert_eq!(
                miner.bus.pop_front(peer),
                Some(PowMessage::BlockFound { node: 0, height: 1 })
            );
        }
        assert_eq!(miner.bus.len(0), 0, "no gossip to self");
    }

    #[test]
    fn serving_an_unreachable_height_reports_unavailable() {
        let mut miner = test_miner(0, test_config(2));
        miner.chain.push(PowBlock::genesis(0, false));

        miner.send_block(1, 5);
        assert_eq!(miner.bus.pop_front(1), Some(PowMessage::BlockUnavailable));
    }

    #[test]
    fn served_blocks_travel_through_the_store() {
        let mut miner = test_miner(0, test_config(2));
        miner.chain.push(PowBlock::genesis(0, false));
        mine_one(&mut miner, &[1]);

        miner.send_block(1, 1);
        let Some(PowMessage::BlockSent { slot, height }) = miner.bus.pop_front(1) else {
            panic!("expected BlockSent");
        };
        assert_eq!(height, 1);
        assert_eq!(miner.store.fetch(slot), Some(miner.chain[1].clone()));
    }

    #[test]
    fn preempted_round_releases_its_transactions() {
        let config = PowConfig {
            initial_difficulty: 64, // unreachable, mining can never finish
            ..test_config(2)
        };
        let mut miner = test_miner(0, config);
        miner.chain.push(PowBlock::genesis(0, false));
        for _ in 0..2 {
            miner.pool.append(5, 6);
        }
        miner.bus.push(0, PowMessage::BlockUnavailable);

        miner.mine();
        let mut cursor = 0;
        while let Some(tx) = miner.pool.receive(&mut cursor) {
            assert!(!tx.collected, "claimed transactions must be handed back");
        }

        // the stray reply is consumed without effect
        miner.handle_next_message();
        assert_eq!(miner.bus.len(0), 0);
    }

    #[test]
    fn difficulty_rises_when_blocks_come_too_fast() {
        let mut config = test_config(1);
        config.adjustment_frequency = 4;
        config.block_time = 10;
        let mut miner = test_miner(0, config);

        miner.chain.push(PowBlock::genesis(0, false));
        for i in 0..4 {
            mine_one(&mut miner, &[i + 1]);
        }
        // synthetic seal times: one second apart, far under the target
        for (i, block) in miner.chain.iter_mut().enumerate() {
            block.timestamp = 1_000_000 + i as u64 * 1_000;
        }

        miner.adjust_difficulty();
        assert_eq!(miner.difficulty, miner.chain.last().unwrap().difficulty + 1);
    }

    #[test]
    fn difficulty_falls_when_blocks_come_too_slowly() {
        let mut config = test_config(1);
        config.adjustment_frequency = 4;
        config.block_time = 10;
        config.initial_difficulty = 1;
        let mut miner = test_miner(0, config);

        miner.chain.push(PowBlock::genesis(1, false));
        miner.difficulty = 1;
        for i in 0..4 {
            let txs = vec![Transaction::new(i + 1, 1, 2)];
            let mut candidate = PowBlock::candidate(miner.tip_hash(), &txs, 1);
            while !candidate.try_nonce(false) {}
            let height = miner.chain.len();
            miner.add_block(candidate, height);
        }
        for (i, block) in miner.chain.iter_mut().enumerate() {
            block.timestamp = 1_000_000 + i as u64 * 100_000;
        }

        miner.adjust_difficulty();
        assert_eq!(
            miner.difficulty,
            miner.chain.last().unwrap().difficulty - 1
        );
    }

    #[test]
    fn expected_minimum_height_follows_the_chain_age() {
        let mut config = test_config(1);
        config.block_time = 10;
        config.synchronization_threshold = 30;
        let mut miner = test_miner(0, config);
        miner.chain.push(PowBlock::genesis(0, false));
        let genesis_time = miner.chain[0].timestamp;

        // 200 seconds of age at one block per 10 seconds is 20 blocks;
        // with a 30% tolerated shortfall the floor is 14
        assert_eq!(
            miner.expected_minimum_height(genesis_time + 200_000),
            14
        );
        assert_eq!(miner.expected_minimum_height(genesis_time), 0);
    }

    #[test]
    fn confirmations_are_emitted_once_blocks_are_buried() {
        let mut config = test_config(1);
        config.confirmation_depth = 2;
        let pool = test_pool(1);
        let bus = Arc::new(MessageBus::new(1));
        let store = Arc::new(BlockStore::new());
        let mut miner = Miner::new(0, config, Arc::clone(&pool), bus, store);
        miner.chain.push(PowBlock::genesis(0, false));

        let first = pool.append(5, 6);
        mine_one(&mut miner, &[first]);
        assert_eq!(pool.live(), 1, "tip transactions are not yet confirmed");

        mine_one(&mut miner, &[100]);
        assert_eq!(pool.live(), 0, "one block on top buries the first at depth 2");
    }

    /// A two-node fork heal, driven single-threaded: node 1 pre-serves the
    /// replies node 0 will ask for, then node 0 synchronizes and ends up
    /// on node 1's longer chain.
    #[test]
    fn synchronization_adopts_a_longer_foreign_chain() {
        let config = test_config(2);
        let pool = test_pool(2);
        let bus = Arc::new(MessageBus::new(2));
        let store = Arc::new(BlockStore::new());

        let mut behind = Miner::new(
            0,
            config.clone(),
            Arc::clone(&pool),
            Arc::clone(&bus),
            Arc::clone(&store),
        );
        let mut ahead = Miner::new(
            1,
            config,
            Arc::clone(&pool),
            Arc::clone(&bus),
            Arc::clone(&store),
        );

        // a difficulty-1 genesis hashes differently from the peer's
        // difficulty-0 one, so the walk must bottom out at height 0 and
        // replace it
        behind.chain.push(PowBlock::genesis(1, false));
        ahead.chain.push(PowBlock::genesis(0, false));
        mine_one(&mut ahead, &[1]);
        mine_one(&mut ahead, &[2]);

        // stage the replies in the order the walk will consume them:
        // heights 2, 1, then genesis
        ahead.send_block(0, 2);
        ahead.send_block(0, 1);
        ahead.send_block(0, 0);

        behind.synchronize(1, 2);

        assert_eq!(behind.chain.len(), 3);
        for height in 0..3 {
            assert_eq!(behind.chain[height].hash, ahead.chain[height].hash);
        }
        assert!(store.is_empty(), "consumed blocks leave the share store");
    }
}
