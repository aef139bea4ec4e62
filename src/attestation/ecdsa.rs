//! ECDSA challenge-response attestation method (§4.9).
//!
//! An alternative to the JWT methods for clients that can sign a challenge
//! with a secp256k1 key but have no TEE attestation service available.

use crate::attestation::jwt::AttestationClaims;
use crate::error::KmsError;
use crate::transport::recover_address;

/// Default freshness window: reject challenges older than 5 minutes.
pub const DEFAULT_FRESHNESS_WINDOW_SECONDS: i64 = 5 * 60;

pub struct EcdsaChallengeVerifier {
    /// `image_digest` to report for a successful verification, since this
    /// method has no notion of a measured image.
    configured_image_digest: Option<String>,
    freshness_window_seconds: i64,
}

impl EcdsaChallengeVerifier {
    pub fn new(configured_image_digest: Option<String>) -> Self {
        Self {
            configured_image_digest,
            freshness_window_seconds: DEFAULT_FRESHNESS_WINDOW_SECONDS,
        }
    }

    /// Verifies a `"<unix_seconds>-<nonce_hex_64chars>"` challenge signed
    /// over `keccak256(app_id || "-" || challenge || "-" ||
    /// hex(public_key_bytes))`.
    pub fn verify(
        &self,
        app_id: &str,
        challenge: &str,
        public_key_bytes: &[u8],
        signature: &[u8],
        now_unix: i64,
    ) -> Result<AttestationClaims, KmsError> {
        let (timestamp_str, nonce_hex) = challenge
            .split_once('-')
            .ok_or(KmsError::InvalidChallenge("challenge must be \"<ts>-<nonce>\""))?;
        let issued_at: i64 = timestamp_str
            .parse()
            .map_err(|_| KmsError::InvalidChallenge("challenge timestamp is not a valid integer"))?;
        if nonce_hex.len() != 64 || !nonce_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KmsError::InvalidChallenge(
                "nonce must be exactly 64 hex characters (32 bytes)",
            ));
        }

        let age = now_unix - issued_at;
        if age < 0 {
            return Err(KmsError::InvalidChallenge("challenge timestamp is in the future"));
        }
        if age > self.freshness_window_seconds {
            return Err(KmsError::InvalidChallenge("challenge has expired"));
        }

        // `recover_address` keccak256-hashes its `message` argument itself,
        // so the raw concatenation (not a pre-hashed digest) is passed here.
        let message = format!("{app_id}-{challenge}-{}", hex::encode(public_key_bytes));
        let recovered_address = recover_address(message.as_bytes(), signature)?;

        let expected_address = address_from_public_key_bytes(public_key_bytes)?;
        if recovered_address != expected_address {
            return Err(KmsError::SignatureMismatch);
        }

        Ok(AttestationClaims {
            app_id: app_id.to_string(),
            image_digest: self
                .configured_image_digest
                .clone()
                .unwrap_or_else(|| "ecdsa:unverified".to_string()),
            nonce: nonce_hex.to_string(),
        })
    }
}

fn address_from_public_key_bytes(bytes: &[u8]) -> Result<[u8; 20], KmsError> {
    let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|_| KmsError::InvalidChallenge("malformed public key bytes"))?;
    Ok(crate::transport::address_from_verifying_key(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sign_message;
    use k256::ecdsa::SigningKey;
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use rand_core::OsRng;

    fn sign_challenge(key: &SigningKey, app_id: &str, challenge: &str) -> (Vec<u8>, Vec<u8>) {
        let public_key_bytes = key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let message = format!("{app_id}-{challenge}-{}", hex::encode(&public_key_bytes));
        let signature = sign_message(key, message.as_bytes());
        (public_key_bytes, signature)
    }

    #[test]
    fn valid_challenge_verifies() {
        let key = SigningKey::random(&mut OsRng);
        let challenge = format!("1000-{}", "ab".repeat(32));
        let (pubkey, signature) = sign_challenge(&key, "app-1", &challenge);

        let verifier = EcdsaChallengeVerifier::new(None);
        let claims = verifier
            .verify("app-1", &challenge, &pubkey, &signature, 1_100)
            .unwrap();
        assert_eq!(claims.app_id, "app-1");
        assert_eq!(claims.image_digest, "ecdsa:unverified");
    }

    #[test]
    fn future_timestamp_rejected() {
        let key = SigningKey::random(&mut OsRng);
        let challenge = format!("5000-{}", "ab".repeat(32));
        let (pubkey, signature) = sign_challenge(&key, "app-1", &challenge);

        let verifier = EcdsaChallengeVerifier::new(None);
        assert!(matches!(
            verifier.verify("app-1", &challenge, &pubkey, &signature, 1_000),
            Err(KmsError::InvalidChallenge(_))
        ));
    }

    #[test]
    fn expired_challenge_rejected() {
        let key = SigningKey::random(&mut OsRng);
        let challenge = format!("1000-{}", "ab".repeat(32));
        let (pubkey, signature) = sign_challenge(&key, "app-1", &challenge);

        let verifier = EcdsaChallengeVerifier::new(None);
        assert!(matches!(
            verifier.verify("app-1", &challenge, &pubkey, &signature, 1_000 + 10_000),
            Err(KmsError::InvalidChallenge(_))
        ));
    }

    #[test]
    fn wrong_nonce_length_rejected() {
        let key = SigningKey::random(&mut OsRng);
        let challenge = "1000-short".to_string();
        let (pubkey, signature) = sign_challenge(&key, "app-1", &challenge);

        let verifier = EcdsaChallengeVerifier::new(None);
        assert!(matches!(
            verifier.verify("app-1", &challenge, &pubkey, &signature, 1_000),
            Err(KmsError::InvalidChallenge(_))
        ));
    }
}
