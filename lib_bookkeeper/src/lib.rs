// The dBFT side of the simulation: a fixed council of bookkeepers running
// leader-based Byzantine agreement, one per worker thread.

pub mod bookkeeper;
