// Message passing between nodes: one FIFO per node index, all guarded by a
// single mutex. FIFO order holds per queue; nothing is promised across
// queues. Queues are unbounded, consensus pressure keeps them short.
//
// Senders release the mutex between pushes to different peers, so two
// peers may briefly observe different states. In proof-of-work that window
// is exactly what lets forks appear and later heal.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Control messages exchanged by proof-of-work miners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowMessage {
    /// A miner extended its chain; `height` is the new tip index.
    BlockFound { node: usize, height: usize },
    /// `node` asks for the sender's block at `height`.
    RequestBlock { node: usize, height: usize },
    /// The requested block waits in the shared store under `slot`.
    BlockSent { slot: usize, height: usize },
    /// The peer's chain does not reach the requested height.
    BlockUnavailable,
}

impl PowMessage {
    /// Short label for the dashboard's queue view.
    pub fn label(&self) -> &'static str {
        match self {
            PowMessage::BlockFound { .. } => "BLOCK_FOUND",
            PowMessage::RequestBlock { .. } => "BLOCK_REQUEST",
            PowMessage::BlockSent { .. } => "BLOCK_SENT",
            PowMessage::BlockUnavailable => "BLOCK_UNAVAILABLE",
        }
    }
}

/// The four dBFT message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbftKind {
    /// The speaker published a proposal for (height, view).
    PrepareRequest,
    /// A delegate approves the proposal.
    PrepareResponse,
    /// A delegate rejects the proposal or its view timed out.
    ChangeView,
    /// A full block for (height, view) is in the shared slot.
    BlockPublished,
}

/// A dBFT control message. Every kind carries the sender's (height, view)
/// so receivers can discard stale traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbftMessage {
    pub kind: DbftKind,
    pub height: usize,
    pub view: usize,
    pub node: usize,
}

impl DbftMessage {
    pub fn label(&self) -> &'static str {
        match self.kind {
            DbftKind::PrepareRequest => "PREPARE_REQUEST",
            DbftKind::PrepareResponse => "PREPARE_RESPONSE",
            DbftKind::ChangeView => "CHANGE_VIEW",
            DbftKind::BlockPublished => "BLOCK_PUBLISHED",
        }
    }
}

/// Per-node FIFO queues under one mutex.
pub struct MessageBus<M> {
    queues: Mutex<Vec<VecDeque<M>>>,
}

impl<M: Clone> MessageBus<M> {
    pub fn new(nodes: usize) -> MessageBus<M> {
        MessageBus {
            queues: Mutex::new((0..nodes).map(|_| VecDeque::new()).collect()),
        }
    }

    pub fn push(&self, target: usize, message: M) {
        let mut queues = self.lock();
        if let Some(queue) = queues.get_mut(target) {
            queue.push_back(message);
        }
    }

    pub fn pop_front(&self, node: usize) -> Option<M> {
        self.lock().get_mut(node).and_then(|q| q.pop_front())
    }

    pub fn peek_front(&self, node: usize) -> Option<M> {
        self.lock().get(node).and_then(|q| q.front().cloned())
    }

    /// Copy of the message at `index`, for scanning a queue without
    /// consuming it.
    pub fn get(&self, node: usize, index: usize) -> Option<M> {
        self.lock().get(node).and_then(|q| q.get(index).cloned())
    }

    /// Remove and return the message at `index`. O(n), used only by the
    /// proof-of-work synchronization scan.
    pub fn remove_at(&self, node: usize, index: usize) -> Option<M> {
        self.lock().get_mut(node).and_then(|q| q.remove(index))
    }

    pub fn len(&self, node: usize) -> usize {
        self.lock().get(node).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, node: usize) -> bool {
        self.len(node) == 0
    }

    /// Non-destructive copy of a whole queue, for the dashboard.
    pub fn snapshot(&self, node: usize) -> Vec<M> {
        self.lock()
            .get(node)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<VecDeque<M>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
