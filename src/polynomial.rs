//! Polynomials over the BLS12-381 scalar field, used for Shamir sharing.
//!
//! `Polynomial::generate` mirrors the teacher's own
//! `generate_secret_polynomial`: push the secret as the constant term, then
//! fill the remaining degree with independently-random coefficients.

use blstrs::Scalar as Fr;
use ff::Field;
use rand_core::RngCore;
use std::collections::HashMap;
use zeroize::Zeroize;

use crate::bls::{self, G2Point};
use crate::node_id::NodeId;

/// `P(x) = coefficients[0] + coefficients[1]*x + ... + coefficients[d]*x^d`.
///
/// Coefficients are zeroized on drop since `coefficients[0]` is, in the DKG
/// and Reshare engines, the dealer's private contribution to the shared
/// secret.
pub struct Polynomial {
    coefficients: Vec<Fr>,
}

impl Drop for Polynomial {
    fn drop(&mut self) {
        for c in &mut self.coefficients {
            // `ff::Field` scalars don't implement `Zeroize` directly; go via
            // the canonical byte encoding and clear that instead.
            let mut bytes = c.to_bytes_le();
            bytes.zeroize();
            *c = Fr::ZERO;
        }
    }
}

impl Polynomial {
    /// Builds a degree-`degree` polynomial with `P(0) = secret` and the
    /// remaining coefficients sampled independently at random. Coefficients
    /// other than the constant term may land on zero; only the recovered
    /// secret itself is required to be nonzero (checked at recovery time).
    pub fn generate<R: RngCore>(secret: Fr, degree: usize, rng: &mut R) -> Self {
        let mut coefficients = Vec::with_capacity(degree + 1);
        coefficients.push(secret);
        for _ in 0..degree {
            coefficients.push(Fr::random(&mut *rng));
        }
        Self { coefficients }
    }

    pub fn from_coefficients(coefficients: Vec<Fr>) -> Self {
        Self { coefficients }
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn constant_term(&self) -> Fr {
        self.coefficients.first().copied().unwrap_or(Fr::ZERO)
    }

    pub fn coefficients(&self) -> &[Fr] {
        &self.coefficients
    }

    /// `P(0) + P1 -> sum`: adds two polynomials of (possibly) different
    /// degrees, padding the shorter with zero coefficients.
    pub fn add(&self, other: &Self) -> Self {
        let len = self.coefficients.len().max(other.coefficients.len());
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let a = self.coefficients.get(i).copied().unwrap_or(Fr::ZERO);
            let b = other.coefficients.get(i).copied().unwrap_or(Fr::ZERO);
            out.push(a + b);
        }
        Self { coefficients: out }
    }
}

/// Evaluates `P(x)` via Horner's method.
pub fn evaluate_polynomial(poly: &Polynomial, x: Fr) -> Fr {
    let mut acc = Fr::ZERO;
    for coeff in poly.coefficients.iter().rev() {
        acc = acc * x + coeff;
    }
    acc
}

/// Evaluates `poly` at every id in `ids`, keyed by node id.
pub fn generate_shares(poly: &Polynomial, ids: &[NodeId]) -> HashMap<NodeId, Fr> {
    ids.iter()
        .map(|id| (*id, evaluate_polynomial(poly, id.to_scalar())))
        .collect()
}

/// `[a_0 * G2_gen, a_1 * G2_gen, ..., a_d * G2_gen]`.
pub fn create_commitments(poly: &Polynomial) -> Vec<G2Point> {
    let g = bls::g2_generator();
    poly.coefficients
        .iter()
        .map(|c| bls::scalar_mul_g2(&g, c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn evaluate_at_zero_is_constant_term() {
        let poly = Polynomial::generate(Fr::from(12345u64), 3, &mut OsRng);
        assert_eq!(evaluate_polynomial(&poly, Fr::ZERO), Fr::from(12345u64));
    }

    #[test]
    fn generate_shares_matches_direct_evaluation() {
        let poly = Polynomial::generate(Fr::from(42u64), 2, &mut OsRng);
        let ids: Vec<NodeId> = (1..=5).map(NodeId).collect();
        let shares = generate_shares(&poly, &ids);
        for id in &ids {
            assert_eq!(shares[id], evaluate_polynomial(&poly, id.to_scalar()));
        }
    }

    #[test]
    fn add_matches_pointwise_evaluation() {
        let p1 = Polynomial::generate(Fr::from(1u64), 2, &mut OsRng);
        let p2 = Polynomial::generate(Fr::from(2u64), 3, &mut OsRng);
        let sum = p1.add(&p2);
        let x = Fr::from(7u64);
        assert_eq!(
            evaluate_polynomial(&sum, x),
            evaluate_polynomial(&p1, x) + evaluate_polynomial(&p2, x)
        );
    }
}
