/// SHA-256 Merkle tree over evidence digests.
///
/// Domain separation prevents second-preimage attacks:
///   leaf_hash(digest)   = SHA-256(0x00 || digest)
///   internal_hash(l, r) = SHA-256(0x01 || l || r)
///
/// If the number of nodes at any level is odd, the last node is promoted
/// (not duplicated), avoiding the CVE-2012-2459 vulnerability.
use crate::crypto::hash::{sha256, Digest};

const LEAF_PREFIX: u8 = 0x00;
const INTERNAL_PREFIX: u8 = 0x01;

/// Hash an evidence digest into a leaf node.
pub fn leaf_hash(digest: &Digest) -> [u8; 32] {
    let mut input = Vec::with_capacity(1 + 32);
    input.push(LEAF_PREFIX);
    input.extend_from_slice(digest.as_bytes());
    sha256(&input)
}

/// Hash two child nodes to produce a parent.
pub fn internal_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut input = Vec::with_capacity(1 + 64);
    input.push(INTERNAL_PREFIX);
    input.extend_from_slice(left);
    input.extend_from_slice(right);
    sha256(&input)
}

/// A SHA-256 Merkle tree.
pub struct MerkleTree {
    /// All levels of the tree. levels[0] = leaves, levels[last] = [root].
    pub(crate) levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Build from evidence digests, in batch order.
    /// Each digest is hashed with the leaf prefix.
    pub fn from_digests(digests: &[Digest]) -> Self {
        Self::from_leaf_hashes(digests.iter().map(leaf_hash).collect())
    }

    /// Build from pre-computed leaf hashes.
    pub fn from_leaf_hashes(leaves: Vec<[u8; 32]>) -> Self {
        if leaves.is_empty() {
            return Self {
                levels: vec![vec![]],
            };
        }

        let mut levels = vec![leaves];
        loop {
            let current = match levels.last() {
                Some(level) if level.len() > 1 => level,
                _ => break,
            };

            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                match pair {
                    [left, right] => next.push(internal_hash(left, right)),
                    // Odd node: promote without duplication
                    [single] => next.push(*single),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                }
            }
            levels.push(next);
        }

        Self { levels }
    }

    /// Get the Merkle root. Returns None if tree is empty.
    pub fn root(&self) -> Option<Digest> {
        self.levels.last()?.first().copied().map(Digest::new)
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, |l| l.len())
    }

    pub fn leaves(&self) -> &[[u8; 32]] {
        self.levels.first().map_or(&[], |l| l.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(byte: u8) -> Digest {
        Digest::new([byte; 32])
    }

    #[test]
    fn test_single_leaf_is_root() {
        let tree = MerkleTree::from_digests(&[d(7)]);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.root(), Some(Digest::new(leaf_hash(&d(7)))));
    }

    #[test]
    fn test_leaf_and_internal_domains_differ() {
        let l = leaf_hash(&d(1));
        assert_ne!(l, [1; 32]);
        assert_ne!(l, internal_hash(&[1; 32], &[1; 32]));
    }

    #[test]
    fn test_two_leaves() {
        let tree = MerkleTree::from_digests(&[d(1), d(2)]);
        let expected = internal_hash(&leaf_hash(&d(1)), &leaf_hash(&d(2)));
        assert_eq!(tree.root(), Some(Digest::new(expected)));
    }

    #[test]
    fn test_three_leaves_odd_promotion() {
        let tree = MerkleTree::from_digests(&[d(1), d(2), d(3)]);
        // Level 1: [H(L1||L2), L3]  (L3 promoted)
        let h12 = internal_hash(&leaf_hash(&d(1)), &leaf_hash(&d(2)));
        let root = internal_hash(&h12, &leaf_hash(&d(3)));
        assert_eq!(tree.root(), Some(Digest::new(root)));
    }

    #[test]
    fn test_empty_tree() {
        let tree = MerkleTree::from_digests(&[]);
        assert_eq!(tree.root(), None);
        assert_eq!(tree.leaf_count(), 0);
    }

    #[test]
    fn test_order_matters() {
        let a = MerkleTree::from_digests(&[d(1), d(2)]);
        let b = MerkleTree::from_digests(&[d(2), d(1)]);
        assert_ne!(a.root(), b.root());
    }
}
