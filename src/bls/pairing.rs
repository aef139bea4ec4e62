//! Pairing-based signing and verification.
//!
//! The master key scheme used throughout this KMS puts public keys in G2 and
//! signatures in G1 (`verify_g1`); `verify_g2` is carried for the mirror
//! assignment and exercised by the property-law test suite, but the DKG and
//! Reshare engines only ever use the G2-pubkey/G1-signature assignment.

use blstrs::Scalar as Fr;

use super::hash_to_curve::{hash_to_g1, hash_to_g2, SIG_DST_G1};
use super::ops::{g1_generator, g2_generator};
use super::point::{G1Point, G2Point};

/// Produces a G1 signature under a secret scalar whose public key lives in
/// G2 (`secret * G2_gen`).
pub fn sign_g1(secret: &Fr, msg: &[u8]) -> G1Point {
    let h = hash_to_g1(msg, SIG_DST_G1);
    super::ops::scalar_mul_g1(&h, secret)
}

/// `e(sig, G2_gen) == e(H(msg), pubkey)`.
pub fn verify_g1(pubkey: &G2Point, msg: &[u8], sig: &G1Point) -> bool {
    let h = hash_to_g1(msg, SIG_DST_G1);
    let lhs = blstrs::pairing(sig.as_affine(), g2_generator().as_affine());
    let rhs = blstrs::pairing(h.as_affine(), pubkey.as_affine());
    lhs == rhs
}

/// Produces a G2 signature under a secret scalar whose public key lives in
/// G1 (`secret * G1_gen`).
pub fn sign_g2(secret: &Fr, msg: &[u8]) -> G2Point {
    let h = hash_to_g2(msg);
    super::ops::scalar_mul_g2(&h, secret)
}

/// `e(G1_gen, sig) == e(pubkey, H(msg))`.
pub fn verify_g2(pubkey: &G1Point, msg: &[u8], sig: &G2Point) -> bool {
    let h = hash_to_g2(msg);
    let lhs = blstrs::pairing(g1_generator().as_affine(), sig.as_affine());
    let rhs = blstrs::pairing(pubkey.as_affine(), h.as_affine());
    lhs == rhs
}
