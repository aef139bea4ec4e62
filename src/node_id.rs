//! Operator identity: Ethereum addresses and the node IDs derived from them.
//!
//! A `node_id` is the x-coordinate at which an operator's polynomial share
//! is evaluated. It must be nonzero (`x = 0` is reserved for the secret
//! itself) and unique within a session's participant set.

use blstrs::Scalar as Fr;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::KmsError;

/// A 20-byte Ethereum-style address identifying an operator.
pub type OperatorAddress = [u8; 20];

/// The zero address, used to mean "broadcast" in message envelopes.
pub const ZERO_ADDRESS: OperatorAddress = [0u8; 20];

/// `keccak256(address)`, truncated to a u64. Deterministic, and nonzero
/// with overwhelming probability; the vanishing-probability zero case is
/// mapped to `1` so the derivation is a total function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub i64);

impl NodeId {
    pub fn from_address(address: &OperatorAddress) -> Self {
        let digest = Keccak256::digest(address);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[24..32]);
        let raw = u64::from_be_bytes(buf) & 0x7fff_ffff_ffff_ffff;
        Self(if raw == 0 { 1 } else { raw as i64 })
    }

    pub fn to_scalar(self) -> Fr {
        Fr::from(self.0.unsigned_abs())
    }
}

/// Rejects operator sets whose derived node IDs collide, per the data model
/// invariant that `node_id` is unique within a session.
pub fn validate_operator_set_no_nodeid_collisions(
    operators: &[OperatorAddress],
) -> Result<Vec<NodeId>, KmsError> {
    let ids: Vec<NodeId> = operators.iter().map(NodeId::from_address).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    for window in sorted.windows(2) {
        if let [a, b] = window {
            if a == b {
                return Err(KmsError::Conflict(format!(
                    "node id collision: two operators both derive to {a:?}"
                )));
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let addr = [7u8; 20];
        assert_eq!(NodeId::from_address(&addr), NodeId::from_address(&addr));
    }

    #[test]
    fn different_addresses_usually_differ() {
        let a = NodeId::from_address(&[1u8; 20]);
        let b = NodeId::from_address(&[2u8; 20]);
        assert_ne!(a, b);
    }

    #[test]
    fn collision_detected() {
        let addrs = vec![[1u8; 20], [2u8; 20], [1u8; 20]];
        assert!(validate_operator_set_no_nodeid_collisions(&addrs).is_err());
    }

    #[test]
    fn no_collision_accepted() {
        let addrs = vec![[1u8; 20], [2u8; 20], [3u8; 20]];
        assert!(validate_operator_set_no_nodeid_collisions(&addrs).is_ok());
    }
}
