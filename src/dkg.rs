//! Distributed Key Generation engine (§4.5).
//!
//! Drives one DKG session through `Init → AwaitingShares → AwaitingAcks →
//! Finalizing → Completed`, with `TimedOut` reachable as a side-exit. This
//! module owns the *logic* of each phase; delivering/receiving wire
//! messages over the network is the caller's job (the core defines the
//! message types and the transport client; routing inbound POST bodies to
//! these methods is the excluded outer layer per §6).

use std::collections::HashMap;

use blstrs::Scalar as Fr;
use ff::Field;
use k256::ecdsa::SigningKey;
use rand_core::RngCore;
use sha3::{Digest, Keccak256};

use crate::bls::{self, G2Point, SecretScalar};
use crate::error::KmsError;
use crate::merkle::{ack_leaf_hash, verify_ack_signature};
use crate::model::{
    Acknowledgement, CommitmentMessage, Epoch, KeyShareVersion, Phase, ProtocolKind,
    ProtocolSessionState, ShareMessage,
};
use crate::node_id::{NodeId, OperatorAddress};
use crate::polynomial::{create_commitments, evaluate_polynomial, generate_shares, Polynomial};
use crate::session;
use crate::shamir::verify_share;
use crate::transport::sign_message;

fn hash_share(share: Fr) -> [u8; 32] {
    Keccak256::digest(bls::scalar_to_bytes(&share)).into()
}

fn hash_commitments(commitments: &[G2Point]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for c in commitments {
        hasher.update(c.to_compressed());
    }
    hasher.finalize().into()
}

/// One participant's view of a DKG session.
pub struct DkgEngine {
    pub session: ProtocolSessionState,
    /// This node's own dealt polynomial, kept only until Finalizing, after
    /// which it's no longer needed and is dropped (zeroizing its
    /// coefficients on the way out).
    own_polynomial: Option<Polynomial>,
    /// Shares this node dealt to every other participant, including itself.
    dealt_shares: HashMap<NodeId, Fr>,
    /// This node's own transport signing key, used to sign the acks it emits
    /// in `receive_share` (§3: "signed by the player's transport key").
    signing_key: SigningKey,
    /// Expected operator address for every participant, used to verify an
    /// incoming ack's signature actually recovers to its claimed `player_id`.
    participant_addresses: HashMap<NodeId, OperatorAddress>,
}

impl DkgEngine {
    pub fn new(
        session_id: String,
        epoch: Epoch,
        threshold: usize,
        participants: Vec<NodeId>,
        self_id: NodeId,
        participant_addresses: HashMap<NodeId, OperatorAddress>,
        signing_key: SigningKey,
        now_unix: i64,
        timeout_seconds: i64,
    ) -> Self {
        Self {
            session: session::new_session(
                session_id,
                ProtocolKind::Dkg,
                epoch,
                threshold,
                participants,
                self_id,
                now_unix,
                timeout_seconds,
            ),
            own_polynomial: None,
            dealt_shares: HashMap::new(),
            signing_key,
            participant_addresses,
        }
    }

    /// Phase 1: generate this node's polynomial, compute its commitments and
    /// the shares it owes every participant (including itself). Returns the
    /// broadcast commitment message and the per-recipient share messages the
    /// caller must deliver over the transport.
    pub fn deal<R: RngCore>(
        &mut self,
        rng: &mut R,
    ) -> Result<(CommitmentMessage, Vec<ShareMessage>), KmsError> {
        if self.session.phase != Phase::Init {
            return Err(KmsError::Conflict(
                "deal called outside Phase::Init".to_string(),
            ));
        }
        let degree = self.session.threshold;
        let secret = bls::random_nonzero_scalar(rng);
        let poly = Polynomial::generate(secret, degree, rng);
        let commitments = create_commitments(&poly);
        let shares = generate_shares(&poly, &self.session.participants);

        let commitment_message = CommitmentMessage {
            session_id: self.session.session_id.clone(),
            dealer_id: self.session.self_id,
            epoch: self.session.epoch,
            commitments: commitments.clone(),
        };
        let share_messages: Vec<ShareMessage> = shares
            .iter()
            .map(|(&recipient, &share)| ShareMessage {
                session_id: self.session.session_id.clone(),
                dealer_id: self.session.self_id,
                recipient_id: recipient,
                epoch: self.session.epoch,
                share: bls::scalar_to_bytes(&share),
            })
            .collect();

        self.session
            .received_commitments
            .insert(self.session.self_id, commitments);
        self.dealt_shares = shares;
        self.own_polynomial = Some(poly);
        session::advance(&mut self.session)?;
        Ok((commitment_message, share_messages))
    }

    /// Phase 2: records a dealer's broadcast commitments.
    pub fn receive_commitment(&mut self, message: CommitmentMessage) -> Result<(), KmsError> {
        if message.session_id != self.session.session_id || message.epoch != self.session.epoch {
            return Err(KmsError::Conflict("commitment for a different session".to_string()));
        }
        self.session
            .received_commitments
            .insert(message.dealer_id, message.commitments);
        Ok(())
    }

    /// Phase 2: verifies an inbound share against the dealer's commitments
    /// (which must already have been received) and, if valid, returns the
    /// `Acknowledgement` this node owes the dealer. An invalid share is
    /// dropped silently — the dealer is simply excluded from `J` later.
    pub fn receive_share(&mut self, message: ShareMessage) -> Result<Option<Acknowledgement>, KmsError> {
        if message.session_id != self.session.session_id || message.epoch != self.session.epoch {
            return Err(KmsError::Conflict("share for a different session".to_string()));
        }
        if message.recipient_id != self.session.self_id {
            return Err(KmsError::Conflict("share addressed to a different node".to_string()));
        }
        let share = bls::scalar_from_bytes(&message.share)
            .ok_or(KmsError::InvalidPoint("share is not a canonical scalar"))?;
        let commitments = self
            .session
            .received_commitments
            .get(&message.dealer_id)
            .cloned()
            .ok_or(KmsError::InvalidShare {
                dealer: message.dealer_id,
            })?;

        if !verify_share(self.session.self_id, share, &commitments) {
            return Ok(None);
        }

        self.session
            .received_shares
            .insert(message.dealer_id, message.share);

        let mut ack = Acknowledgement {
            dealer_id: message.dealer_id,
            player_id: self.session.self_id,
            epoch: self.session.epoch,
            share_hash: hash_share(share),
            commitment_hash: hash_commitments(&commitments),
            signature: Vec::new(),
        };
        ack.signature = sign_message(&self.signing_key, &ack_leaf_hash(&ack));
        Ok(Some(ack))
    }

    /// Phase 2 (continued): records an acknowledgement received from a peer
    /// vouching for a dealer, after verifying `ack.signature` recovers to
    /// `ack.player_id`'s known operator address — a different, and stronger,
    /// check than the transport envelope's own signature, since this is what
    /// lets a Phase-4 broadcast of third-party acks be trusted without every
    /// recipient having independently collected the identical ack set.
    pub fn receive_ack(&mut self, ack: Acknowledgement) -> Result<(), KmsError> {
        verify_ack_signature(&ack, &self.participant_addresses)?;
        session::record_ack(&mut self.session, ack);
        Ok(())
    }

    /// Advances `Init`/`AwaitingShares`/`AwaitingAcks` bookkeeping phases
    /// once the caller has delivered/received everything for the current
    /// phase. No-op if already past `AwaitingAcks`.
    pub fn advance_bookkeeping_phase(&mut self) -> Result<(), KmsError> {
        match self.session.phase {
            Phase::Init => session::advance(&mut self.session),
            Phase::AwaitingShares => session::advance(&mut self.session),
            _ => Ok(()),
        }
    }

    /// Phase 3: if at least `threshold + 1` dealers have each been
    /// acknowledged by at least `threshold + 1` players, sums this node's
    /// shares from those finalized dealers and its own, aggregates their
    /// commitments, and returns the resulting `KeyShareVersion`. Returns
    /// `Err(Threshold { .. })` if not enough dealers have finalized yet.
    pub fn try_finalize(&mut self, now_unix: i64) -> Result<KeyShareVersion, KmsError> {
        if !matches!(self.session.phase, Phase::AwaitingAcks | Phase::Finalizing) {
            return Err(KmsError::Conflict(
                "try_finalize called before AwaitingAcks".to_string(),
            ));
        }
        let needed = self.session.threshold + 1;
        let finalized = session::finalized_dealers(&self.session, needed);
        if finalized.len() < needed {
            return Err(KmsError::Threshold {
                needed,
                have: finalized.len(),
            });
        }

        if self.session.phase == Phase::AwaitingAcks {
            session::advance(&mut self.session)?;
        }

        let mut share_sum = Fr::ZERO;
        let mut commitment_sums: Vec<G2Point> = Vec::new();
        for &dealer in &finalized {
            let share_bytes = self
                .session
                .received_shares
                .get(&dealer)
                .copied()
                .ok_or(KmsError::InvalidShare { dealer })?;
            let share = bls::scalar_from_bytes(&share_bytes)
                .ok_or(KmsError::InvalidPoint("share is not a canonical scalar"))?;
            share_sum += share;

            let commitments = self
                .session
                .received_commitments
                .get(&dealer)
                .ok_or(KmsError::InvalidShare { dealer })?;
            commitment_sums = sum_commitments(&commitment_sums, commitments);
        }

        let master_public_key = commitment_sums
            .first()
            .copied()
            .ok_or(KmsError::InvalidPoint("no commitments aggregated"))?;

        session::advance(&mut self.session)?;

        Ok(KeyShareVersion {
            epoch: self.session.epoch,
            node_id: self.session.self_id,
            private_share: SecretScalar::new(share_sum),
            commitments: commitment_sums,
            master_public_key,
            created_at_unix: now_unix,
            active: false,
        })
    }

    pub fn check_timeout(&mut self, now_unix: i64) -> bool {
        session::check_deadline(&mut self.session, now_unix)
    }
}

/// Pointwise sum of two commitment vectors, padding the shorter with
/// identities so degree mismatches (which should not happen between honest
/// dealers with the same threshold) don't panic.
fn sum_commitments(a: &[G2Point], b: &[G2Point]) -> Vec<G2Point> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or_else(G2Point::identity);
            let y = b.get(i).copied().unwrap_or_else(G2Point::identity);
            bls::add_g2(&x, &y)
        })
        .collect()
}
