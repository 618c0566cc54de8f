// Core data types shared by both consensus simulations: the SHA-256 digest
// helper, transactions, Merkle summaries and the two block flavours.

pub mod block;
pub mod digest;
pub mod merkle;
pub mod transaction;
