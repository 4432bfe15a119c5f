//! Merkle tree over block transaction ids
//!
//! Binary SHA-256 tree. At each level an odd trailing node is paired with
//! itself. A block without transactions has the all-zero root, and a single
//! transaction is its own root.

use crate::types::TransactionId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Root of an empty tree
pub const EMPTY_ROOT: [u8; 32] = [0u8; 32];

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Side on which a sibling sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Sibling is on the left
    Left,
    /// Sibling is on the right
    Right,
}

/// Inclusion proof for one transaction of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Proven transaction
    pub transaction_id: TransactionId,
    /// Position in the block
    pub position: usize,
    /// Siblings from the leaf level upwards
    pub siblings: Vec<(Direction, [u8; 32])>,
    /// Root the proof folds to
    pub root: [u8; 32],
}

impl MerkleProof {
    /// Fold the siblings and compare against `root`
    pub fn verify(&self) -> bool {
        let folded = self
            .siblings
            .iter()
            .fold(*self.transaction_id.as_bytes(), |current, (direction, sibling)| {
                match direction {
                    Direction::Left => hash_pair(sibling, &current),
                    Direction::Right => hash_pair(&current, sibling),
                }
            });
        folded == self.root
    }

    /// Verify against an externally trusted root (e.g. a stored block header)
    pub fn verify_against(&self, root: &[u8; 32]) -> bool {
        &self.root == root && self.verify()
    }
}

/// Merkle tree with every level materialised
#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaves: Vec<TransactionId>,
    // levels[0] holds leaf hashes, the last level holds the root
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Build from transaction ids in block order
    pub fn build(leaves: &[TransactionId]) -> Self {
        let mut levels = Vec::new();
        if !leaves.is_empty() {
            let mut level: Vec<[u8; 32]> = leaves.iter().map(|id| *id.as_bytes()).collect();
            while level.len() > 1 {
                let parent = next_level(&level);
                levels.push(level);
                level = parent;
            }
            levels.push(level);
        }
        Self {
            leaves: leaves.to_vec(),
            levels,
        }
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Whether the tree has no leaves
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Root hash
    pub fn root(&self) -> [u8; 32] {
        self.levels
            .last()
            .and_then(|top| top.first().copied())
            .unwrap_or(EMPTY_ROOT)
    }

    /// Proof for the leaf at `position`
    pub fn proof(&self, position: usize) -> Option<MerkleProof> {
        let transaction_id = *self.leaves.get(position)?;
        let mut siblings = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut index = position;

        for level in self.levels.iter().take(self.levels.len().saturating_sub(1)) {
            let entry = if index % 2 == 0 {
                // Odd tail pairs with itself
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                (Direction::Right, *sibling)
            } else {
                (Direction::Left, level[index - 1])
            };
            siblings.push(entry);
            index /= 2;
        }

        Some(MerkleProof {
            transaction_id,
            position,
            siblings,
            root: self.root(),
        })
    }

    /// Proof for a given transaction id
    pub fn proof_for(&self, id: &TransactionId) -> Option<MerkleProof> {
        let position = self.leaves.iter().position(|leaf| leaf == id)?;
        self.proof(position)
    }
}

/// Root over transaction ids without keeping the tree
pub fn merkle_root(ids: &[TransactionId]) -> [u8; 32] {
    if ids.is_empty() {
        return EMPTY_ROOT;
    }
    let mut level: Vec<[u8; 32]> = ids.iter().map(|id| *id.as_bytes()).collect();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    fn id(data: &[u8]) -> TransactionId {
        TransactionId::from_bytes(hash_bytes(data))
    }

    fn leaf(id: &TransactionId) -> [u8; 32] {
        *id.as_bytes()
    }

    #[test]
    fn test_empty_tree() {
        let tree = MerkleTree::build(&[]);
        assert!(tree.is_empty());
        assert_eq!(tree.root(), EMPTY_ROOT);
        assert_eq!(merkle_root(&[]), EMPTY_ROOT);
        assert!(tree.proof(0).is_none());
    }

    #[test]
    fn test_single_leaf_is_root() {
        let a = id(b"a");
        let tree = MerkleTree::build(&[a]);
        assert_eq!(tree.root(), leaf(&a));

        let proof = tree.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(proof.verify());
    }

    #[test]
    fn test_odd_leaf_duplicated() {
        let ids = [id(b"a"), id(b"b"), id(b"c")];
        let h01 = hash_pair(&leaf(&ids[0]), &leaf(&ids[1]));
        let h22 = hash_pair(&leaf(&ids[2]), &leaf(&ids[2]));
        let expected = hash_pair(&h01, &h22);

        assert_eq!(MerkleTree::build(&ids).root(), expected);
        assert_eq!(merkle_root(&ids), expected);
    }

    #[test]
    fn test_four_leaves() {
        let ids = [id(b"a"), id(b"b"), id(b"c"), id(b"d")];
        let h01 = hash_pair(&leaf(&ids[0]), &leaf(&ids[1]));
        let h23 = hash_pair(&leaf(&ids[2]), &leaf(&ids[3]));
        assert_eq!(merkle_root(&ids), hash_pair(&h01, &h23));
    }

    #[test]
    fn test_every_proof_verifies() {
        let ids: Vec<_> = (0u8..7).map(|i| id(&[i])).collect();
        let tree = MerkleTree::build(&ids);

        for (position, tx_id) in ids.iter().enumerate() {
            let proof = tree.proof_for(tx_id).unwrap();
            assert_eq!(proof.position, position);
            assert_eq!(proof.siblings.len(), 3);
            assert!(proof.verify_against(&tree.root()));
        }
    }

    #[test]
    fn test_two_leaf_directions() {
        let ids = [id(b"a"), id(b"b")];
        let tree = MerkleTree::build(&ids);

        assert_eq!(tree.proof(0).unwrap().siblings, vec![(Direction::Right, leaf(&ids[1]))]);
        assert_eq!(tree.proof(1).unwrap().siblings, vec![(Direction::Left, leaf(&ids[0]))]);
    }

    #[test]
    fn test_tampered_proof_fails() {
        let ids = [id(b"a"), id(b"b"), id(b"c")];
        let tree = MerkleTree::build(&ids);

        let mut proof = tree.proof(1).unwrap();
        proof.transaction_id = id(b"forged");
        assert!(!proof.verify());

        let proof = tree.proof(1).unwrap();
        assert!(!proof.verify_against(&hash_bytes(b"other root")));
    }
}
