//! JWT-based attestation: Google Confidential Space and Intel Trust
//! Authority token verification (§4.9).

use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attestation::jwks::JwksCache;
use crate::error::KmsError;

pub const GOOGLE_CS_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/metadata/jwk/signer@confidentialspace-sign.iam.gserviceaccount.com";
pub const GOOGLE_CS_ISSUER: &str = "https://confidentialcomputing.googleapis.com";
pub const INTEL_TA_JWKS_URL: &str = "https://portal.trustauthority.intel.com/certs";
pub const INTEL_TA_ISSUER: &str = "https://portal.trustauthority.intel.com";

const AUDIENCE_STS: &str = "https://sts.googleapis.com";
const AUDIENCE_KMS: &str = "EigenX KMS";

const MIN_SWVERSION: u64 = 250_300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issuer {
    GoogleConfidentialSpace,
    IntelTrustAuthority,
}

/// The claims this core cares about, extracted from either issuer's token
/// after all provider-specific rule checks pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationClaims {
    pub app_id: String,
    pub image_digest: String,
    pub nonce: String,
}

pub struct JwtVerifier {
    issuer: Issuer,
    jwks: Arc<JwksCache>,
    project_id: String,
    debug_mode: bool,
}

/// Raw JWT payload shape, permissive enough to parse both issuers' tokens;
/// provider-specific rules below pick out the fields each one needs.
#[derive(Debug, Serialize, Deserialize)]
struct RawClaims {
    iss: String,
    aud: Value,
    exp: i64,
    nbf: Option<i64>,
    swname: Option<String>,
    attester_tcb: Option<Vec<String>>,
    hwmodel: Option<String>,
    swversion: Option<Vec<String>>,
    #[serde(default)]
    tdx: Option<TdxClaims>,
    dbgstat: Option<String>,
    support_attributes: Option<Vec<String>>,
    #[serde(rename = "gce")]
    gce: Option<GceClaims>,
    eat_nonce: Option<Value>,
    #[serde(default)]
    image_digest: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TdxClaims {
    gcp_attester_tcb_status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GceClaims {
    project_id: Option<String>,
    instance_name: Option<String>,
}

impl JwtVerifier {
    pub fn new(issuer: Issuer, jwks: Arc<JwksCache>, project_id: String, debug_mode: bool) -> Self {
        Self {
            issuer,
            jwks,
            project_id,
            debug_mode,
        }
    }

    fn issuer_url(&self) -> &'static str {
        match self.issuer {
            Issuer::GoogleConfidentialSpace => GOOGLE_CS_ISSUER,
            Issuer::IntelTrustAuthority => INTEL_TA_ISSUER,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<AttestationClaims, KmsError> {
        let header = decode_header(token)
            .map_err(|e| KmsError::InvalidAttestation(format!("malformed jwt header: {e}")))?;
        let key_id = header
            .kid
            .clone()
            .ok_or_else(|| KmsError::InvalidAttestation("jwt header missing kid".to_string()))?;

        let candidates = self.jwks.matching_keys(&key_id, header.alg).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer_url()]);
        validation.set_audience(&[AUDIENCE_STS, AUDIENCE_KMS]);
        validation.validate_nbf = true;
        validation.leeway = 0;

        let mut last_err = None;
        for jwk in candidates {
            let decoding_key = match DecodingKey::from_jwk(&jwk) {
                Ok(key) => key,
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            };
            match decode::<RawClaims>(token, &decoding_key, &validation) {
                Ok(data) => return self.check_claims(data.claims),
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(KmsError::InvalidAttestation(format!(
            "jwt verification failed against every candidate key: {}",
            last_err.unwrap_or_else(|| "no candidate keys".to_string())
        )))
    }

    fn check_claims(&self, claims: RawClaims) -> Result<AttestationClaims, KmsError> {
        if claims.swname.as_deref() != Some("CONFIDENTIAL_SPACE") {
            return Err(KmsError::InvalidAttestation(
                "swname must be CONFIDENTIAL_SPACE".to_string(),
            ));
        }

        match self.issuer {
            Issuer::GoogleConfidentialSpace => {
                if claims.attester_tcb.as_deref() != Some(&["INTEL".to_string()]) {
                    return Err(KmsError::InvalidAttestation(
                        "attester_tcb must equal [\"INTEL\"]".to_string(),
                    ));
                }
                if claims.hwmodel.as_deref() != Some("GCP_INTEL_TDX") {
                    return Err(KmsError::InvalidAttestation(
                        "hwmodel must be GCP_INTEL_TDX".to_string(),
                    ));
                }
            }
            Issuer::IntelTrustAuthority => {
                if claims.hwmodel.as_deref() != Some("INTEL_TDX") {
                    return Err(KmsError::InvalidAttestation(
                        "hwmodel must be INTEL_TDX".to_string(),
                    ));
                }
                let status = claims
                    .tdx
                    .as_ref()
                    .and_then(|t| t.gcp_attester_tcb_status.as_deref());
                if status != Some("UpToDate") {
                    return Err(KmsError::InvalidAttestation(
                        "tdx.gcp_attester_tcb_status must be UpToDate".to_string(),
                    ));
                }
            }
        }

        let swversion = claims
            .swversion
            .as_ref()
            .and_then(|v| v.first())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| KmsError::InvalidAttestation("missing or malformed swversion".to_string()))?;
        if swversion < MIN_SWVERSION {
            return Err(KmsError::InvalidAttestation(format!(
                "swversion {swversion} below minimum {MIN_SWVERSION}"
            )));
        }

        if self.debug_mode {
            tracing::debug!("debug mode: skipping dbgstat/support_attributes checks");
        } else {
            if claims.dbgstat.as_deref() != Some("disabled-since-boot") {
                return Err(KmsError::InvalidAttestation(
                    "dbgstat must be disabled-since-boot in production".to_string(),
                ));
            }
            let required = match self.issuer {
                Issuer::GoogleConfidentialSpace => "STABLE",
                Issuer::IntelTrustAuthority => "EXPERIMENTAL",
            };
            let has_required = claims
                .support_attributes
                .as_ref()
                .is_some_and(|attrs| attrs.iter().any(|a| a == required));
            if !has_required {
                return Err(KmsError::InvalidAttestation(format!(
                    "support_attributes must contain {required} in production"
                )));
            }
        }

        let project_id = claims
            .gce
            .as_ref()
            .and_then(|g| g.project_id.as_deref())
            .ok_or_else(|| KmsError::InvalidAttestation("missing gce.project_id".to_string()))?;
        if project_id != self.project_id {
            return Err(KmsError::InvalidAttestation(format!(
                "project id {project_id} does not match configured project"
            )));
        }

        let app_id = claims
            .gce
            .as_ref()
            .and_then(|g| g.instance_name.as_deref())
            .and_then(|name| name.rsplit('-').next())
            .ok_or_else(|| KmsError::InvalidAttestation("missing gce.instance_name".to_string()))?
            .to_string();

        let nonce = extract_nonce(&claims.eat_nonce)?;

        Ok(AttestationClaims {
            app_id,
            image_digest: claims.image_digest.unwrap_or_default(),
            nonce,
        })
    }
}

/// `eat_nonce` is either a bare string or a single-element array of strings.
fn extract_nonce(value: &Option<Value>) -> Result<String, KmsError> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Array(items)) if items.len() == 1 => match &items[0] {
            Value::String(s) => Ok(s.clone()),
            _ => Err(KmsError::InvalidAttestation(
                "eat_nonce array element must be a string".to_string(),
            )),
        },
        _ => Err(KmsError::InvalidAttestation(
            "eat_nonce must be a string or a single-element array of strings".to_string(),
        )),
    }
}
