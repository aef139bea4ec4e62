//! Attestation verification: decides whether an application may receive its
//! secrets (§4.9).

pub mod ecdsa;
pub mod jwks;
pub mod jwt;

use std::sync::Arc;

use crate::error::KmsError;
use ecdsa::EcdsaChallengeVerifier;
use jwt::{AttestationClaims, JwtVerifier};

/// Which attestation method a `/secrets/v1` request declares, matching the
/// wire literal in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationMethod {
    Gcp,
    Intel,
    Ecdsa,
}

impl AttestationMethod {
    pub fn parse(s: &str) -> Result<Self, KmsError> {
        match s {
            "gcp" => Ok(Self::Gcp),
            "intel" => Ok(Self::Intel),
            "ecdsa" => Ok(Self::Ecdsa),
            other => Err(KmsError::InvalidAttestation(format!(
                "unknown attestation method {other:?}"
            ))),
        }
    }
}

/// A request to verify one attestation, routed by `method`.
pub enum VerificationRequest<'a> {
    Jwt {
        method: AttestationMethod,
        token: &'a str,
    },
    Ecdsa {
        app_id: &'a str,
        challenge: &'a str,
        public_key: &'a [u8],
        signature: &'a [u8],
        now_unix: i64,
    },
}

/// Dispatches a verification request to the registered verifier for its
/// declared method.
pub struct Manager {
    gcp: Option<JwtVerifier>,
    intel: Option<JwtVerifier>,
    ecdsa: Option<EcdsaChallengeVerifier>,
}

impl Manager {
    pub fn new(
        gcp: Option<JwtVerifier>,
        intel: Option<JwtVerifier>,
        ecdsa: Option<EcdsaChallengeVerifier>,
    ) -> Self {
        Self { gcp, intel, ecdsa }
    }

    pub async fn verify(&self, request: VerificationRequest<'_>) -> Result<AttestationClaims, KmsError> {
        match request {
            VerificationRequest::Jwt { method, token } => {
                let verifier = match method {
                    AttestationMethod::Gcp => self.gcp.as_ref(),
                    AttestationMethod::Intel => self.intel.as_ref(),
                    AttestationMethod::Ecdsa => None,
                }
                .ok_or_else(|| {
                    KmsError::InvalidAttestation(format!("method {method:?} is not registered"))
                })?;
                verifier.verify(token).await
            }
            VerificationRequest::Ecdsa {
                app_id,
                challenge,
                public_key,
                signature,
                now_unix,
            } => {
                let verifier = self.ecdsa.as_ref().ok_or_else(|| {
                    KmsError::InvalidAttestation("ecdsa method is not registered".to_string())
                })?;
                verifier.verify(app_id, challenge, public_key, signature, now_unix)
            }
        }
    }
}

/// Builds JWKS caches for both JWT issuers pointed at the constants in §6,
/// for callers that want the default provider URLs rather than overrides
/// (e.g. in tests, against a mock server).
pub fn default_jwks_caches() -> (Arc<jwks::JwksCache>, Arc<jwks::JwksCache>) {
    (
        Arc::new(jwks::JwksCache::new(jwt::GOOGLE_CS_JWKS_URL)),
        Arc::new(jwks::JwksCache::new(jwt::INTEL_TA_JWKS_URL)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parsing() {
        assert_eq!(AttestationMethod::parse("gcp").unwrap(), AttestationMethod::Gcp);
        assert_eq!(AttestationMethod::parse("intel").unwrap(), AttestationMethod::Intel);
        assert_eq!(AttestationMethod::parse("ecdsa").unwrap(), AttestationMethod::Ecdsa);
        assert!(AttestationMethod::parse("bogus").is_err());
    }

    #[tokio::test]
    async fn unregistered_method_rejected() {
        let manager = Manager::new(None, None, None);
        let result = manager
            .verify(VerificationRequest::Jwt {
                method: AttestationMethod::Gcp,
                token: "x.y.z",
            })
            .await;
        assert!(result.is_err());
    }
}
