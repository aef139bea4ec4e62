//! Group arithmetic over already-validated points.
//!
//! Every function here takes [`G1Point`]/[`G2Point`] values, which can only
//! be constructed through a validating deserializer (see `point.rs`), so
//! none of these operations can fail on a malformed point — the `InvalidPoint`
//! failure mode lives entirely at the deserialization boundary.

use blstrs::Scalar as Fr;
use group::Group as _;

use super::point::{G1Point, G2Point};

pub fn scalar_mul_g1(p: &G1Point, s: &Fr) -> G1Point {
    G1Point::from_projective_trusted(p.to_projective() * s)
}

pub fn scalar_mul_g2(p: &G2Point, s: &Fr) -> G2Point {
    G2Point::from_projective_trusted(p.to_projective() * s)
}

pub fn add_g1(a: &G1Point, b: &G1Point) -> G1Point {
    G1Point::from_projective_trusted(a.to_projective() + b.to_projective())
}

pub fn add_g2(a: &G2Point, b: &G2Point) -> G2Point {
    G2Point::from_projective_trusted(a.to_projective() + b.to_projective())
}

pub fn negate_g1(p: &G1Point) -> G1Point {
    G1Point::from_projective_trusted(-p.to_projective())
}

pub fn negate_g2(p: &G2Point) -> G2Point {
    G2Point::from_projective_trusted(-p.to_projective())
}

/// Sums a list of G1 points; the empty sum is the identity (point at
/// infinity), matching BLS signature aggregation semantics.
pub fn aggregate_g1(points: &[G1Point]) -> G1Point {
    let sum = points
        .iter()
        .fold(blstrs::G1Projective::identity(), |acc, p| acc + p.to_projective());
    G1Point::from_projective_trusted(sum)
}

/// Sums a list of G2 points; the empty sum is the identity.
pub fn aggregate_g2(points: &[G2Point]) -> G2Point {
    let sum = points
        .iter()
        .fold(blstrs::G2Projective::identity(), |acc, p| acc + p.to_projective());
    G2Point::from_projective_trusted(sum)
}

pub fn g1_generator() -> G1Point {
    G1Point::from_projective_trusted(blstrs::G1Projective::generator())
}

pub fn g2_generator() -> G2Point {
    G2Point::from_projective_trusted(blstrs::G2Projective::generator())
}
