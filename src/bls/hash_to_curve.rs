//! Hash-to-curve with domain separation.
//!
//! Two distinct DSTs are used for G1 and must never be shared between
//! purposes: signing uses the standard BLS signature DST, identity-based
//! key derivation uses a KMS-specific DST. Reusing a DST across purposes
//! would let an attacker replay a hash computed for one purpose as though it
//! were computed for the other.

use blstrs::{G1Projective, G2Projective};

use super::point::{G1Point, G2Point};

pub const SIG_DST_G1: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";
pub const IBE_DST_G1: &[u8] = b"EIGENX_KMS_IBE_BLS12381G1_XMD:SHA-256_SSWU_RO_";
pub const SIG_DST_G2: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Hashes a message to a point in G1 under the given domain separation tag.
/// Hash-to-curve always lands inside the correct prime-order subgroup by
/// construction, so the result needs no further validation.
pub fn hash_to_g1(msg: &[u8], dst: &[u8]) -> G1Point {
    G1Point::from_projective_trusted(G1Projective::hash_to_curve(msg, dst, &[]))
}

/// Hashes a message to a point in G2 under the fixed signature DST.
pub fn hash_to_g2(msg: &[u8]) -> G2Point {
    G2Point::from_projective_trusted(G2Projective::hash_to_curve(msg, SIG_DST_G2, &[]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(
            hash_to_g1(b"hello", SIG_DST_G1),
            hash_to_g1(b"hello", SIG_DST_G1)
        );
        assert_eq!(hash_to_g2(b"hello"), hash_to_g2(b"hello"));
    }

    #[test]
    fn distinct_dsts_give_distinct_points() {
        assert_ne!(
            hash_to_g1(b"hello", SIG_DST_G1),
            hash_to_g1(b"hello", IBE_DST_G1)
        );
    }

    #[test]
    fn distinct_messages_give_distinct_points() {
        assert_ne!(
            hash_to_g1(b"hello", SIG_DST_G1),
            hash_to_g1(b"world", SIG_DST_G1)
        );
    }
}
