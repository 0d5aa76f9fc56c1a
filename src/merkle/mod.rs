/// Merkle aggregation for batch anchoring.
///
/// Many evidence digests are combined under one root so that a single
/// on-chain transaction covers the whole batch. Each member keeps an
/// inclusion proof that verifies against the anchored root offline.
pub mod proof;
pub mod tree;

pub use proof::{verify_inclusion, MerkleProof, Position};
pub use tree::MerkleTree;
