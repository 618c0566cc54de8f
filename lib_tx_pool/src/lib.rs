// The transaction pool stands in for every peer that uses the chain
// without taking part in consensus. The generator fills it, consumer nodes
// claim or scan it, and confirmed entries leave through the telemetry sink.

pub mod pool;
pub mod telemetry;
