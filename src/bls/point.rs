//! Validated newtypes over BLS12-381 group elements.
//!
//! `blstrs`'s own affine/projective types can represent off-curve or
//! wrong-subgroup byte strings until `is_on_curve`/`is_torsion_free` is
//! called; nothing in the type system stops a caller from skipping that
//! check. `G1Point`/`G2Point` close that gap: the only way to build one from
//! bytes is [`G1Point::from_compressed`]/[`G2Point::from_compressed`], which
//! perform both checks, so every `G1Point`/`G2Point` in the rest of the crate
//! is known-valid by construction.

use blstrs::{G1Affine, G1Projective, G2Affine, G2Projective};
use group::{Curve, Group as _};
use serde::{Deserialize, Serialize};

use crate::error::KmsError;

const G1_COMPRESSED_SIZE: usize = 48;
const G2_COMPRESSED_SIZE: usize = 96;

macro_rules! validated_point {
    ($name:ident, $affine:ty, $projective:ty, $size:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name($affine);

        impl $name {
            /// Parses a compressed point, rejecting anything off-curve or
            /// outside the prime-order subgroup. The identity element is
            /// accepted here; callers that must reject it (public keys,
            /// commitments, signatures) call [`Self::reject_identity`].
            pub fn from_compressed(bytes: &[u8; $size]) -> Result<Self, KmsError> {
                let point: Option<$affine> = Option::from(<$affine>::from_compressed(bytes));
                let point = point.ok_or(KmsError::InvalidPoint("not a valid curve point"))?;
                if !bool::from(point.is_on_curve()) {
                    return Err(KmsError::InvalidPoint("point not on curve"));
                }
                if !bool::from(point.is_torsion_free()) {
                    return Err(KmsError::InvalidPoint("point not in prime-order subgroup"));
                }
                Ok(Self(point))
            }

            pub fn to_compressed(self) -> [u8; $size] {
                self.0.to_compressed()
            }

            pub fn identity() -> Self {
                Self(<$affine>::identity())
            }

            pub fn is_identity(&self) -> bool {
                bool::from(group::prime::PrimeCurveAffine::is_identity(&self.0))
            }

            /// Enforces the "disallowed as a public key, commitment, or
            /// signature" rule from the data model: identity passes
            /// structural validation but fails this role check.
            pub fn reject_identity(self) -> Result<Self, KmsError> {
                if self.is_identity() {
                    Err(KmsError::InvalidPoint("identity element not allowed here"))
                } else {
                    Ok(self)
                }
            }

            pub(crate) fn from_projective_trusted(p: $projective) -> Self {
                Self(p.to_affine())
            }

            pub(crate) fn as_affine(&self) -> &$affine {
                &self.0
            }

            pub(crate) fn to_projective(self) -> $projective {
                <$projective>::from(self.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.to_compressed()))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.to_compressed())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes: Vec<u8> = serde::de::Deserialize::deserialize(deserializer)?;
                let array: [u8; $size] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("wrong point encoding length"))?;
                Self::from_compressed(&array).map_err(serde::de::Error::custom)
            }
        }
    };
}

validated_point!(G1Point, G1Affine, G1Projective, G1_COMPRESSED_SIZE);
validated_point!(G2Point, G2Affine, G2Projective, G2_COMPRESSED_SIZE);
