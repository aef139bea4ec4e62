//! The BLS12-381 scalar field `Fr`, and a zeroizing wrapper for secret shares.

use blstrs::Scalar as Fr;
use ff::Field;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Canonical little-endian 32-byte encoding of a scalar.
///
/// This is the single encoding used throughout the core: for persistence,
/// for `ShareHash`, and for every wire message that carries a scalar.
pub fn scalar_to_bytes(s: &Fr) -> [u8; 32] {
    s.to_bytes_le()
}

/// Parses a canonical little-endian scalar encoding, rejecting non-canonical
/// representations (values `>= r`).
pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Option<Fr> {
    Option::from(Fr::from_bytes_le(bytes))
}

/// Samples a uniformly random nonzero scalar.
pub fn random_nonzero_scalar<R: RngCore>(rng: &mut R) -> Fr {
    loop {
        let candidate = Fr::random(&mut *rng);
        if !bool::from(candidate.is_zero()) {
            return candidate;
        }
    }
}

/// A secret scalar (a share, or a polynomial's constant term) that is
/// zeroized on drop and never implicitly cloned.
///
/// `Clone`/`Copy` are deliberately not derived: moving a `SecretScalar`
/// should be the only way to pass it around, and an explicit
/// [`SecretScalar::duplicate`] call marks the rare place that needs a copy.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretScalar(#[zeroize(skip)] Fr);

impl SecretScalar {
    pub fn new(value: Fr) -> Self {
        Self(value)
    }

    pub fn expose_secret(&self) -> &Fr {
        &self.0
    }

    /// Explicit, non-`Clone` duplication for the rare case (e.g. summing
    /// shares from multiple dealers) where a copy is genuinely needed.
    pub fn duplicate(&self) -> Self {
        Self(self.0)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        scalar_to_bytes(&self.0)
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        scalar_from_bytes(bytes).map(Self)
    }
}

impl std::fmt::Debug for SecretScalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretScalar(..)")
    }
}

/// Serialized as the canonical little-endian encoding, same as any other
/// scalar; the zeroizing behavior only protects in-memory lifetime.
impl Serialize for SecretScalar {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes_array::serialize(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for SecretScalar {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes_array::deserialize(deserializer)?;
        Self::from_bytes(&bytes).ok_or_else(|| serde::de::Error::custom("invalid scalar encoding"))
    }
}

/// Minimal fixed-size byte array (de)serialization helper, since `serde`
/// does not special-case `[u8; 32]` the way it does `&[u8]`.
mod serde_bytes_array {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let vec: Vec<u8> = serde::de::Deserialize::deserialize(deserializer)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn scalar_roundtrip() {
        let s = Fr::random(&mut OsRng);
        let bytes = scalar_to_bytes(&s);
        assert_eq!(scalar_from_bytes(&bytes), Some(s));
    }

    #[test]
    fn secret_scalar_roundtrip() {
        let s = random_nonzero_scalar(&mut OsRng);
        let secret = SecretScalar::new(s);
        let bytes = secret.to_bytes();
        let restored = SecretScalar::from_bytes(&bytes).unwrap();
        assert_eq!(restored.expose_secret(), &s);
    }

    #[test]
    fn random_nonzero_is_never_zero() {
        for _ in 0..64 {
            let s = random_nonzero_scalar(&mut OsRng);
            assert!(!bool::from(s.is_zero()));
        }
    }
}
