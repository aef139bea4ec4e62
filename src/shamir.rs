//! Shamir share verification and secret recovery.

use blstrs::Scalar as Fr;
use ff::Field;
use std::collections::{HashMap, HashSet};

use crate::bls::{self, G2Point};
use crate::error::KmsError;
use crate::node_id::NodeId;

/// `λ_i(0) = Π_{j in subset, j != i} (0 - x_j) / (x_i - x_j)`.
///
/// Duplicate ids in `subset` are treated as a single id; the result does not
/// depend on the order of `subset`.
pub fn lagrange_coefficient(i: NodeId, subset: &[NodeId]) -> Result<Fr, KmsError> {
    let unique: HashSet<NodeId> = subset.iter().copied().collect();
    let xi = i.to_scalar();
    let mut numerator = Fr::ONE;
    let mut denominator = Fr::ONE;
    for &j in &unique {
        if j == i {
            continue;
        }
        let xj = j.to_scalar();
        numerator *= -xj;
        denominator *= xi - xj;
    }
    let inv = Option::<Fr>::from(denominator.invert()).ok_or(KmsError::IntegerOverflow)?;
    Ok(numerator * inv)
}

/// Lagrange-interpolates `P(0)` from a set of `(id, P(id))` shares, failing
/// if the recovered secret is the additive identity (a protocol failure,
/// never a legitimate master secret).
pub fn recover_secret(shares: &HashMap<NodeId, Fr>) -> Result<Fr, KmsError> {
    let ids: Vec<NodeId> = shares.keys().copied().collect();
    let mut acc = Fr::ZERO;
    for (&id, &share) in shares {
        let lambda = lagrange_coefficient(id, &ids)?;
        acc += lambda * share;
    }
    if bool::from(acc.is_zero()) {
        return Err(KmsError::ZeroSecret);
    }
    Ok(acc)
}

/// `Σ_{k=0..=deg} commitments[k] * id^k`: the public commitment to the share
/// that `id` should hold under the polynomial `commitments` commits to,
/// without knowing the share itself. Also the quantity a reshare dealer's
/// `C_j[0]` is checked against (scaled by `id`'s Lagrange coefficient) to
/// keep the master public key invariant across epochs.
pub fn public_share_commitment(id: NodeId, commitments: &[G2Point]) -> G2Point {
    let x = id.to_scalar();
    let mut power = Fr::ONE;
    let mut acc = G2Point::identity();
    for commitment in commitments {
        acc = bls::add_g2(&acc, &bls::scalar_mul_g2(commitment, &power));
        power *= x;
    }
    acc
}

/// `share * G2_gen == Σ_{k=0..=deg} commitments[k] * id^k`.
pub fn verify_share(id: NodeId, share: Fr, commitments: &[G2Point]) -> bool {
    let lhs = bls::scalar_mul_g2(&bls::g2_generator(), &share);
    lhs == public_share_commitment(id, commitments)
}
