// In-process stand-in for the peer-to-peer layer: typed per-node message
// queues plus the shared slots nodes use to hand whole blocks and
// proposals to each other without copying them through the queues.

pub mod bus;
pub mod shared;
