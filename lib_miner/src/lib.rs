// The proof-of-work side of the simulation: one miner per worker thread,
// racing the others to extend a shared-prefix chain.

pub mod miner;
