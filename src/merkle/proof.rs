/// Merkle inclusion proof generation and verification.
use serde::{Deserialize, Serialize};

use super::tree::{internal_hash, leaf_hash, MerkleTree};
use crate::crypto::hash::Digest;

/// Position of a sibling in a Merkle proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

/// A Merkle inclusion proof for a single evidence digest.
///
/// Serialized as JSON into `merkle_proofs.proof_json`; hashes are hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    /// `SHA-256(0x00 || digest)`, not the digest itself.
    pub leaf_hash: Digest,
    /// Sibling hashes ordered from the leaf level up to the root.
    pub siblings: Vec<(Position, Digest)>,
}

impl MerkleTree {
    /// Generate an inclusion proof for the leaf at `index`.
    pub fn prove(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut siblings = Vec::new();
        let mut idx = index;

        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_idx = idx ^ 1;
            if sibling_idx < level.len() {
                let position = if idx % 2 == 0 {
                    Position::Right
                } else {
                    Position::Left
                };
                siblings.push((position, Digest::new(level[sibling_idx])));
            }
            // No sibling: the node was promoted unchanged to the next level
            idx /= 2;
        }

        Some(MerkleProof {
            leaf_index: index,
            leaf_hash: Digest::new(self.leaves()[index]),
            siblings,
        })
    }
}

impl MerkleProof {
    /// Recompute the root implied by this proof.
    pub fn computed_root(&self) -> Digest {
        let mut current = *self.leaf_hash.as_bytes();
        for (position, sibling) in &self.siblings {
            current = match position {
                Position::Left => internal_hash(sibling.as_bytes(), &current),
                Position::Right => internal_hash(&current, sibling.as_bytes()),
            };
        }
        Digest::new(current)
    }

    pub fn verify(&self, root: &Digest) -> bool {
        &self.computed_root() == root
    }
}

/// Verify that `digest` is included under `root` according to `proof`.
///
/// The leaf is recomputed from `digest`, so an internal node passed off as a
/// member digest never matches.
pub fn verify_inclusion(digest: &Digest, proof: &MerkleProof, root: &Digest) -> bool {
    proof.leaf_hash.as_bytes() == &leaf_hash(digest) && proof.verify(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests(n: usize) -> Vec<Digest> {
        (0..n)
            .map(|i| Digest::of(format!("evidence-{i}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_proof_single_leaf() {
        let leaves = digests(1);
        let tree = MerkleTree::from_digests(&leaves);
        let proof = tree.prove(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(verify_inclusion(&leaves[0], &proof, &tree.root().unwrap()));
    }

    #[test]
    fn test_every_leaf_proves_for_odd_and_even_sizes() {
        for n in [2, 3, 4, 7, 50, 100] {
            let leaves = digests(n);
            let tree = MerkleTree::from_digests(&leaves);
            let root = tree.root().unwrap();
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = tree.prove(i).unwrap();
                assert!(verify_inclusion(leaf, &proof, &root), "n={n} leaf={i}");
            }
        }
    }

    #[test]
    fn test_wrong_root_or_digest_fails() {
        let leaves = digests(4);
        let tree = MerkleTree::from_digests(&leaves);
        let proof = tree.prove(1).unwrap();
        assert!(!proof.verify(&Digest::new([0xFF; 32])));
        assert!(!verify_inclusion(&leaves[2], &proof, &tree.root().unwrap()));
    }

    #[test]
    fn test_internal_node_does_not_verify_as_member() {
        let leaves: Vec<Digest> = (1..=4u8).map(|b| Digest::new([b; 32])).collect();
        let tree = MerkleTree::from_digests(&leaves);
        let root = tree.root().unwrap();

        // Left child of the root, paired with the right child as sibling
        let left = Digest::new(tree.levels[1][0]);
        let shortened = MerkleProof {
            leaf_index: 0,
            leaf_hash: left,
            siblings: vec![(Position::Right, Digest::new(tree.levels[1][1]))],
        };
        assert!(shortened.verify(&root));
        assert!(!verify_inclusion(&left, &shortened, &root));

        // Raw digests are not leaves either
        let raw = MerkleProof {
            leaf_hash: leaves[0],
            ..tree.prove(0).unwrap()
        };
        assert!(!verify_inclusion(&leaves[0], &raw, &root));
    }

    #[test]
    fn test_tampered_sibling_fails() {
        let leaves = digests(5);
        let tree = MerkleTree::from_digests(&leaves);
        let mut proof = tree.prove(3).unwrap();
        proof.siblings[0].1 = Digest::new([0; 32]);
        assert!(!proof.verify(&tree.root().unwrap()));
    }

    #[test]
    fn test_proof_out_of_bounds() {
        let tree = MerkleTree::from_digests(&digests(1));
        assert!(tree.prove(1).is_none());
    }

    #[test]
    fn test_proof_json_roundtrip_still_verifies() {
        let leaves = digests(6);
        let tree = MerkleTree::from_digests(&leaves);
        let proof = tree.prove(5).unwrap();
        let json = serde_json::to_string(&proof).unwrap();
        assert!(json.contains("\"right\"") || json.contains("\"left\""));
        let back: MerkleProof = serde_json::from_str(&json).unwrap();
        assert!(back.verify(&tree.root().unwrap()));
    }
}
