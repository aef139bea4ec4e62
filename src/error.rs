//! Error taxonomy for the KMS core.
//!
//! Every subsystem returns one of these variants rather than a boxed
//! `dyn Error`; callers match on the kind to decide whether a failure is
//! locally recoverable (exclude a peer, retry) or fatal (abort startup).

use thiserror::Error;

use crate::node_id::NodeId;

/// Top-level error type returned by the core's public APIs.
#[derive(Debug, Error)]
pub enum KmsError {
    /// A deserialized G1/G2 point failed the on-curve or subgroup check.
    #[error("invalid point: {0}")]
    InvalidPoint(&'static str),

    /// `verify_share` rejected a share against its commitments.
    #[error("invalid share from dealer {dealer:?}")]
    InvalidShare { dealer: NodeId },

    /// An acknowledgement failed signature, epoch, or share-hash checks.
    #[error("invalid acknowledgement: {0}")]
    InvalidAck(&'static str),

    /// JWT parse/verify/claims/freshness/nonce failure.
    #[error("invalid attestation: {0}")]
    InvalidAttestation(String),

    /// ECDSA challenge expired, future-dated, malformed, or wrong nonce length.
    #[error("invalid challenge: {0}")]
    InvalidChallenge(&'static str),

    /// Transport-signature recovered address did not match the declared sender.
    #[error("signature mismatch: recovered address does not match declared sender")]
    SignatureMismatch,

    /// Insufficient valid inputs to complete a protocol phase.
    #[error("threshold not met: need {needed}, have {have}")]
    Threshold { needed: usize, have: usize },

    /// Session exceeded its protocol timeout.
    #[error("session {0} timed out")]
    Timeout(i64),

    /// Underlying persistence store failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Duplicate session, schema mismatch, or operator address mismatch.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Externally requested shutdown observed at a suspension point.
    #[error("cancelled")]
    Cancelled,

    /// Polynomial recovery evaluated to the additive identity.
    #[error("recovered secret is zero")]
    ZeroSecret,

    /// An arithmetic operation on sizes/indices overflowed.
    #[error("integer overflow")]
    IntegerOverflow,
}

pub type Result<T> = std::result::Result<T, KmsError>;
