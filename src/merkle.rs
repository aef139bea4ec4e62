//! Merkle tree over dealer acknowledgements, used for the reshare
//! dealer-equivocation defense (§4.6, §4.7).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::KmsError;
use crate::model::Acknowledgement;
use crate::node_id::{NodeId, OperatorAddress};
use crate::transport::recover_address;

/// Sign-extends an epoch to the 32-byte big-endian width the leaf encoding
/// requires (`epoch_be32`), matching the `player_id_be8`/`dealer_id_be8`
/// convention of representing the `i64` in its own two's-complement bytes.
fn epoch_be32(epoch: crate::model::Epoch) -> [u8; 32] {
    let fill = if epoch < 0 { 0xff } else { 0x00 };
    let mut out = [fill; 32];
    out[24..].copy_from_slice(&epoch.to_be_bytes());
    out
}

fn leaf_hash(ack: &Acknowledgement) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(ack.player_id.0.to_be_bytes());
    hasher.update(ack.dealer_id.0.to_be_bytes());
    hasher.update(epoch_be32(ack.epoch));
    hasher.update(ack.share_hash);
    hasher.update(ack.commitment_hash);
    hasher.finalize().into()
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// A full merkle tree built over a sorted (by `player_id`) set of
/// acknowledgements. Sorting before construction makes the root independent
/// of the order acknowledgements arrived in.
pub struct MerkleTree {
    /// `levels[0]` is the leaf layer; `levels.last()` is `[root]`.
    levels: Vec<Vec<[u8; 32]>>,
}

/// A proof of inclusion for one leaf: sibling hashes from the leaf layer up
/// to (but excluding) the root, plus the leaf's index (needed to know
/// whether each sibling is a left or right neighbor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub siblings: Vec<[u8; 32]>,
}

impl MerkleTree {
    pub fn build(acks: &[Acknowledgement]) -> Self {
        let mut sorted: Vec<&Acknowledgement> = acks.iter().collect();
        sorted.sort_by_key(|a| a.player_id.0);

        let mut leaves: Vec<[u8; 32]> = sorted.iter().map(|a| leaf_hash(a)).collect();
        if leaves.is_empty() {
            leaves.push([0u8; 32]);
        }

        let mut levels = vec![leaves];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().expect("checked non-empty above");
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            let mut i = 0;
            while i < current.len() {
                let left = current[i];
                let right = if i + 1 < current.len() {
                    current[i + 1]
                } else {
                    // Odd node out: duplicate it against itself.
                    current[i]
                };
                next.push(node_hash(&left, &right));
                i += 2;
            }
            levels.push(next);
        }
        Self { levels }
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    /// Proof of inclusion for the leaf at `leaf_index` in the sorted
    /// (by `player_id`) ordering `build` used.
    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.levels.first()?.len() {
            return None;
        }
        let mut siblings = Vec::new();
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            let sibling = level.get(sibling_index).or(level.get(index)).copied()?;
            siblings.push(sibling);
            index /= 2;
        }
        Some(MerkleProof {
            leaf_index,
            siblings,
        })
    }
}

/// Recomputes the root from a leaf hash and its proof, without needing the
/// full tree.
pub fn verify_proof(leaf: [u8; 32], proof: &MerkleProof, root: [u8; 32]) -> bool {
    let mut hash = leaf;
    let mut index = proof.leaf_index;
    for sibling in &proof.siblings {
        hash = if index % 2 == 0 {
            node_hash(&hash, sibling)
        } else {
            node_hash(sibling, &hash)
        };
        index /= 2;
    }
    hash == root
}

pub fn ack_leaf_hash(ack: &Acknowledgement) -> [u8; 32] {
    leaf_hash(ack)
}

/// Verifies `ack.signature` recovers to `ack.player_id`'s known operator
/// address over the leaf encoding (§3, §4.10 `InvalidAck`). A missing
/// directory entry is itself a rejection: an engine should never be handed
/// an ack from a participant it wasn't also given the address of.
pub fn verify_ack_signature(
    ack: &Acknowledgement,
    participant_addresses: &HashMap<NodeId, OperatorAddress>,
) -> Result<(), KmsError> {
    let expected = participant_addresses
        .get(&ack.player_id)
        .ok_or(KmsError::InvalidAck("unknown player_id, no address on file"))?;
    let recovered = recover_address(&leaf_hash(ack), &ack.signature)
        .map_err(|_| KmsError::InvalidAck("signature verification failed"))?;
    if recovered != *expected {
        return Err(KmsError::InvalidAck("signature verification failed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::NodeId;

    fn test_ack(dealer: i64, player: i64, epoch: i64) -> Acknowledgement {
        Acknowledgement {
            dealer_id: NodeId(dealer),
            player_id: NodeId(player),
            epoch,
            share_hash: [player as u8; 32],
            commitment_hash: [dealer as u8; 32],
            signature: vec![0u8; 65],
        }
    }

    #[test]
    fn deterministic_regardless_of_order() {
        let acks = vec![test_ack(1, 1, 10), test_ack(1, 2, 10), test_ack(1, 3, 10)];
        let mut shuffled = acks.clone();
        shuffled.reverse();
        assert_eq!(
            MerkleTree::build(&acks).root(),
            MerkleTree::build(&shuffled).root()
        );
    }

    #[test]
    fn proof_soundness() {
        let acks: Vec<Acknowledgement> = (1..=7).map(|p| test_ack(1, p, 5)).collect();
        let tree = MerkleTree::build(&acks);
        let root = tree.root();

        let mut sorted = acks.clone();
        sorted.sort_by_key(|a| a.player_id.0);

        for (i, ack) in sorted.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            let leaf = ack_leaf_hash(ack);
            assert!(verify_proof(leaf, &proof, root));

            let mut tampered_leaf = leaf;
            tampered_leaf[0] ^= 0xff;
            assert!(!verify_proof(tampered_leaf, &proof, root));

            let mut tampered_proof = proof.clone();
            if let Some(first) = tampered_proof.siblings.first_mut() {
                first[0] ^= 0xff;
            }
            assert!(!verify_proof(leaf, &tampered_proof, root));

            let mut tampered_root = root;
            tampered_root[0] ^= 0xff;
            assert!(!verify_proof(leaf, &proof, tampered_root));
        }
    }

    #[test]
    fn proof_length_bounded_by_log2() {
        let acks: Vec<Acknowledgement> = (1..=13).map(|p| test_ack(1, p, 5)).collect();
        let tree = MerkleTree::build(&acks);
        let bound = (acks.len() as f64).log2().ceil() as usize + 1;
        for i in 0..acks.len() {
            assert!(tree.proof(i).unwrap().siblings.len() <= bound);
        }
    }
}
