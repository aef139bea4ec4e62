//! BLS12-381 primitive layer: scalars, validated G1/G2 points, hash-to-curve,
//! pairing-based sign/verify, and aggregation.
//!
//! Built directly on `blstrs`, the same dependency the teacher crate uses in
//! its confidential-key-derivation ciphersuite for G1/G2 arithmetic and
//! hash-to-curve.

mod hash_to_curve;
mod ops;
mod pairing;
mod point;
mod scalar;

pub use blstrs::Scalar as Fr;

pub use hash_to_curve::{hash_to_g1, hash_to_g2, IBE_DST_G1, SIG_DST_G1, SIG_DST_G2};
pub use ops::{
    add_g1, add_g2, aggregate_g1, aggregate_g2, g1_generator, g2_generator, negate_g1, negate_g2,
    scalar_mul_g1, scalar_mul_g2,
};
pub use pairing::{sign_g1, sign_g2, verify_g1, verify_g2};
pub use point::{G1Point, G2Point};
pub use scalar::{random_nonzero_scalar, scalar_from_bytes, scalar_to_bytes, SecretScalar};
