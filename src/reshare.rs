//! Proactive resharing engine (§4.6).
//!
//! Reuses the DKG's share/verify/ack machinery but (a) scales each dealer's
//! contribution by its Lagrange coefficient so the sum still interpolates to
//! the unchanged secret, (b) requires every dealer's zero-coefficient
//! commitment to match the Lagrange-scaled commitment to that dealer's old
//! share before acknowledging it, (c) gates activation on a Phase-4 merkle
//! broadcast rather than ack count alone, and (d) requires a quorum of
//! matching completion signatures before the pending version is activated.

use std::collections::HashMap;

use blstrs::Scalar as Fr;
use ff::Field;
use k256::ecdsa::SigningKey;
use rand_core::RngCore;
use sha3::{Digest, Keccak256};

use crate::bls::{self, G2Point, SecretScalar};
use crate::error::KmsError;
use crate::merkle::{ack_leaf_hash, verify_ack_signature, verify_proof, MerkleTree};
use crate::model::{
    Acknowledgement, CommitmentBroadcastMessage, CommitmentMessage, CompletionMessage, Epoch,
    KeyShareVersion, Phase, ProtocolKind, ProtocolSessionState, ShareMessage,
};
use crate::node_id::{NodeId, OperatorAddress};
use crate::polynomial::{create_commitments, generate_shares, Polynomial};
use crate::session;
use crate::shamir::{lagrange_coefficient, public_share_commitment, verify_share};
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

pub struct ReshareEngine {
    pub session: ProtocolSessionState,
    old_commitments: HashMap<NodeId, Vec<G2Point>>,
    mpk: G2Point,
    /// This reshare's own Lagrange coefficient, applied to this node's old
    /// share to derive the new polynomial's constant term.
    own_lambda: Fr,
    /// Completion signatures collected so far, keyed by the signer's
    /// node id, alongside the merkle root they attest to.
    completions: HashMap<NodeId, [u8; 32]>,
    /// This node's own transport signing key, used to sign the acks it
    /// emits in `receive_share`.
    signing_key: SigningKey,
    /// Expected operator address for every participant, used to verify an
    /// incoming ack's signature actually recovers to its claimed `player_id`.
    participant_addresses: HashMap<NodeId, OperatorAddress>,
}

impl ReshareEngine {
    /// `old_commitments` maps each participating dealer to its old-epoch
    /// polynomial commitments (needed to check the Lagrange-scaling
    /// invariant on every incoming `CommitmentMessage`). `mpk` is
    /// `v_old.commitments[0]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        new_epoch: Epoch,
        threshold: usize,
        participants: Vec<NodeId>,
        self_id: NodeId,
        old_commitments: HashMap<NodeId, Vec<G2Point>>,
        mpk: G2Point,
        participant_addresses: HashMap<NodeId, OperatorAddress>,
        signing_key: SigningKey,
        now_unix: i64,
        timeout_seconds: i64,
    ) -> Result<Self, KmsError> {
        let own_lambda = lagrange_coefficient(self_id, &participants)?;
        Ok(Self {
            session: session::new_session(
                session_id,
                ProtocolKind::Reshare,
                new_epoch,
                threshold,
                participants,
                self_id,
                now_unix,
                timeout_seconds,
            ),
            old_commitments,
            mpk,
            own_lambda,
            completions: HashMap::new(),
            signing_key,
            participant_addresses,
        })
    }

    /// Phase 1: deals a fresh polynomial `R_self` with `R_self(0) = λ_self *
    /// old_share`.
    pub fn deal<R: RngCore>(
        &mut self,
        old_share: &SecretScalar,
        rng: &mut R,
    ) -> Result<(CommitmentMessage, Vec<ShareMessage>), KmsError> {
        if self.session.phase != Phase::Init {
            return Err(KmsError::Conflict(
                "deal called outside Phase::Init".to_string(),
            ));
        }
        let constant_term = self.own_lambda * *old_share.expose_secret();
        let poly = Polynomial::generate(constant_term, self.session.threshold, rng);
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
        session::advance(&mut self.session)?;
        Ok((commitment_message, share_messages))
    }

    /// Phase 2: records a dealer's commitments, rejecting (by not storing
    /// them at all — the dealer is simply then absent from `received_commitments`
    /// and so can never finalize) any whose zero-coefficient fails the
    /// Lagrange-scaling invariant against that dealer's old commitments.
    pub fn receive_commitment(&mut self, message: CommitmentMessage) -> Result<(), KmsError> {
        if message.session_id != self.session.session_id || message.epoch != self.session.epoch {
            return Err(KmsError::Conflict("commitment for a different session".to_string()));
        }
        let dealer = message.dealer_id;
        let Some(old) = self.old_commitments.get(&dealer) else {
            return Err(KmsError::InvalidShare { dealer });
        };
        let lambda = lagrange_coefficient(dealer, &self.session.participants)?;
        let old_public_share = public_share_commitment(dealer, old);
        let expected_zero_commitment = bls::scalar_mul_g2(&old_public_share, &lambda);

        let Some(&actual_zero_commitment) = message.commitments.first() else {
            return Err(KmsError::InvalidShare { dealer });
        };
        if actual_zero_commitment != expected_zero_commitment {
            // Invariant violated: this dealer's contribution would shift
            // the master public key. Drop it rather than error the whole
            // session, mirroring the DKG's "exclude, don't abort" policy.
            return Ok(());
        }

        self.session
            .received_commitments
            .insert(dealer, message.commitments);
        Ok(())
    }

    /// Phase 2: identical share-verification contract to the DKG engine.
    pub fn receive_share(&mut self, message: ShareMessage) -> Result<Option<Acknowledgement>, KmsError> {
        if message.session_id != self.session.session_id || message.epoch != self.session.epoch {
            return Err(KmsError::Conflict("share for a different session".to_string()));
        }
        if message.recipient_id != self.session.self_id {
            return Err(KmsError::Conflict("share addressed to a different node".to_string()));
        }
        let share = bls::scalar_from_bytes(&message.share)
            .ok_or(KmsError::InvalidPoint("share is not a canonical scalar"))?;
        let Some(commitments) = self.session.received_commitments.get(&message.dealer_id).cloned() else {
            return Ok(None);
        };
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

    pub fn receive_ack(&mut self, ack: Acknowledgement) -> Result<(), KmsError> {
        verify_ack_signature(&ack, &self.participant_addresses)?;
        session::record_ack(&mut self.session, ack);
        Ok(())
    }

    pub fn advance_bookkeeping_phase(&mut self) -> Result<(), KmsError> {
        match self.session.phase {
            Phase::Init | Phase::AwaitingShares => session::advance(&mut self.session),
            _ => Ok(()),
        }
    }

    /// Phase 4: builds one `CommitmentBroadcastMessage` per other
    /// participant this node dealt shares to, each carrying this node's own
    /// dealt commitments, every ack it collected for its own dealing
    /// (sorted by `player_id`, matching `MerkleTree::build`'s ordering), and
    /// a proof that the recipient's own ack is among them. A dealer that
    /// shows different peers inconsistent ack sets can't produce a proof
    /// that verifies against both, so equivocation surfaces as a failed
    /// `verify_broadcast` rather than going undetected.
    pub fn build_broadcasts(&self) -> Vec<CommitmentBroadcastMessage> {
        let mut acks_for_me: Vec<Acknowledgement> = self
            .session
            .acks
            .iter()
            .filter(|a| a.dealer_id == self.session.self_id)
            .cloned()
            .collect();
        acks_for_me.sort_by_key(|a| a.player_id.0);

        let tree = MerkleTree::build(&acks_for_me);
        let own_commitments = self
            .session
            .received_commitments
            .get(&self.session.self_id)
            .cloned()
            .unwrap_or_default();

        acks_for_me
            .iter()
            .enumerate()
            .filter(|(_, ack)| ack.player_id != self.session.self_id)
            .filter_map(|(index, ack)| {
                let proof = tree.proof(index)?;
                Some(CommitmentBroadcastMessage {
                    session_id: self.session.session_id.clone(),
                    from: self.session.self_id,
                    to: ack.player_id,
                    epoch: self.session.epoch,
                    commitments: own_commitments.clone(),
                    acks: acks_for_me.clone(),
                    merkle_proof_for_this_recipient: proof,
                })
            })
            .collect()
    }

    /// Phase 4: validates an incoming broadcast addressed to this node. The
    /// root the proof is checked against is rebuilt from `broadcast.acks`
    /// itself (never taken on faith), and the leaf proven is this node's own
    /// locally-recorded ack for `broadcast.from`'s dealing — not whatever
    /// entry the broadcast claims is this node's, which a malicious dealer
    /// could simply fabricate to match its own (possibly equivocated) root.
    pub fn verify_broadcast(&self, broadcast: &CommitmentBroadcastMessage) -> Result<(), KmsError> {
        if broadcast.to != self.session.self_id {
            return Err(KmsError::Conflict(
                "broadcast addressed to a different node".to_string(),
            ));
        }
        let expected_commitments = self
            .session
            .received_commitments
            .get(&broadcast.from)
            .ok_or(KmsError::InvalidShare { dealer: broadcast.from })?;
        if &broadcast.commitments != expected_commitments {
            return Err(KmsError::Conflict(
                "broadcast commitments disagree with what this dealer sent in Phase 2".to_string(),
            ));
        }
        let own_ack = self
            .session
            .acks
            .iter()
            .find(|a| a.dealer_id == broadcast.from && a.player_id == self.session.self_id)
            .ok_or(KmsError::InvalidAck("no locally-recorded ack for this dealer"))?;

        let root = MerkleTree::build(&broadcast.acks).root();
        let leaf = ack_leaf_hash(own_ack);
        if !verify_proof(leaf, &broadcast.merkle_proof_for_this_recipient, root) {
            return Err(KmsError::InvalidAck("merkle proof failed to verify"));
        }
        Ok(())
    }

    /// Phase 3/5: sums shares from dealers that both met the ack threshold
    /// and passed the Lagrange-scaling check (i.e. are present in
    /// `received_commitments`), asserting that the aggregated zero
    /// commitment equals `mpk` before returning anything — per §4.6, this
    /// assertion failing aborts the reshare without activating.
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
        let mut commitment_sum: Vec<G2Point> = Vec::new();
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
            commitment_sum = sum_commitments(&commitment_sum, commitments);
        }

        let new_mpk = commitment_sum
            .first()
            .copied()
            .ok_or(KmsError::InvalidPoint("no commitments aggregated"))?;
        if new_mpk != self.mpk {
            return Err(KmsError::Conflict(
                "reshare would change the master public key; aborting without activating".to_string(),
            ));
        }

        session::advance(&mut self.session)?;

        Ok(KeyShareVersion {
            epoch: self.session.epoch,
            node_id: self.session.self_id,
            private_share: SecretScalar::new(share_sum),
            commitments: commitment_sum,
            master_public_key: new_mpk,
            created_at_unix: now_unix,
            active: false,
        })
    }

    /// Phase 5: records a peer's completion signature and reports whether
    /// `threshold + 1` matching signatures (same `merkle_root`) have now
    /// been seen, gating activation of the pending version.
    pub fn receive_completion(&mut self, message: CompletionMessage) -> bool {
        self.completions.insert(message.node_id, message.merkle_root);
        let needed = self.session.threshold + 1;
        let target = message.merkle_root;
        self.completions.values().filter(|&&r| r == target).count() >= needed
    }

    pub fn check_timeout(&mut self, now_unix: i64) -> bool {
        session::check_deadline(&mut self.session, now_unix)
    }
}

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

/// Leaf-hash helper re-exported for callers building `Acknowledgement`
/// broadcasts outside this module (e.g. integration tests).
pub fn ack_hash(ack: &Acknowledgement) -> [u8; 32] {
    ack_leaf_hash(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polynomial::evaluate_polynomial;
    use crate::shamir::recover_secret;
    use crate::transport::address_from_verifying_key;
    use rand_core::OsRng;
    use std::collections::HashMap as Map;

    fn participants(n: i64) -> Vec<NodeId> {
        (1..=n).map(NodeId).collect()
    }

    /// Builds an "old" DKG-style polynomial/commitments/shares set the
    /// reshare tests can reshare from.
    fn old_epoch(ids: &[NodeId], threshold: usize, secret: Fr) -> (HashMap<NodeId, Fr>, Vec<G2Point>) {
        let poly = Polynomial::generate(secret, threshold, &mut OsRng);
        let commitments = create_commitments(&poly);
        let shares: HashMap<NodeId, Fr> = ids
            .iter()
            .map(|&id| (id, evaluate_polynomial(&poly, id.to_scalar())))
            .collect();
        (shares, commitments)
    }

    fn keyed_participants(
        ids: &[NodeId],
    ) -> (HashMap<NodeId, SigningKey>, HashMap<NodeId, OperatorAddress>) {
        let keys: HashMap<NodeId, SigningKey> = ids
            .iter()
            .map(|&id| (id, SigningKey::random(&mut OsRng)))
            .collect();
        let addresses = keys
            .iter()
            .map(|(&id, key)| (id, address_from_verifying_key(key.verifying_key())))
            .collect();
        (keys, addresses)
    }

    #[allow(clippy::too_many_arguments)]
    fn engine(
        session_id: &str,
        new_epoch: Epoch,
        threshold: usize,
        participants: Vec<NodeId>,
        self_id: NodeId,
        old_commitments: HashMap<NodeId, Vec<G2Point>>,
        mpk: G2Point,
        keys: &HashMap<NodeId, SigningKey>,
        addresses: &HashMap<NodeId, OperatorAddress>,
        now_unix: i64,
        timeout_seconds: i64,
    ) -> ReshareEngine {
        ReshareEngine::new(
            session_id.to_string(),
            new_epoch,
            threshold,
            participants,
            self_id,
            old_commitments,
            mpk,
            addresses.clone(),
            keys[&self_id].clone(),
            now_unix,
            timeout_seconds,
        )
        .unwrap()
    }

    #[test]
    fn reshare_preserves_master_public_key() {
        let ids = participants(5);
        let threshold = 2;
        let secret = Fr::from(42u64);
        let (old_shares, old_commitments) = old_epoch(&ids, threshold, secret);
        let mpk = old_commitments[0];
        let (keys, addresses) = keyed_participants(&ids);

        let old_commitments_by_dealer: HashMap<NodeId, Vec<G2Point>> =
            ids.iter().map(|&id| (id, old_commitments.clone())).collect();

        let mut engines: Map<NodeId, ReshareEngine> = ids
            .iter()
            .map(|&id| {
                (
                    id,
                    engine(
                        "reshare-1",
                        1,
                        threshold,
                        ids.clone(),
                        id,
                        old_commitments_by_dealer.clone(),
                        mpk,
                        &keys,
                        &addresses,
                        1_000,
                        300,
                    ),
                )
            })
            .collect();

        let mut all_commitments = Vec::new();
        let mut all_shares = Vec::new();
        for &id in &ids {
            let old_share = SecretScalar::new(old_shares[&id]);
            let (commitment, shares) = engines.get_mut(&id).unwrap().deal(&old_share, &mut OsRng).unwrap();
            all_commitments.push(commitment);
            all_shares.extend(shares);
        }

        for commitment in &all_commitments {
            for &id in &ids {
                engines
                    .get_mut(&id)
                    .unwrap()
                    .receive_commitment(commitment.clone())
                    .unwrap();
            }
        }

        let mut acks_by_dealer: HashMap<NodeId, Vec<Acknowledgement>> = HashMap::new();
        for share in all_shares {
            let recipient = share.recipient_id;
            let dealer = share.dealer_id;
            if let Some(ack) = engines.get_mut(&recipient).unwrap().receive_share(share).unwrap() {
                acks_by_dealer.entry(dealer).or_default().push(ack);
            }
        }

        for engine in engines.values_mut() {
            engine.advance_bookkeeping_phase().unwrap();
            engine.advance_bookkeeping_phase().unwrap();
        }

        for acks in acks_by_dealer.values() {
            for ack in acks {
                for &id in &ids {
                    engines.get_mut(&id).unwrap().receive_ack(ack.clone()).unwrap();
                }
            }
        }

        let mut new_shares = Map::new();
        for &id in &ids {
            let version = engines.get_mut(&id).unwrap().try_finalize(1_000).unwrap();
            assert_eq!(version.master_public_key, mpk);
            new_shares.insert(id, *version.private_share.expose_secret());
        }

        let recovered = recover_secret(&new_shares).unwrap();
        assert_eq!(recovered, secret);

        // Every dealer's Phase-4 broadcast verifies against each recipient's
        // own locally-collected ack.
        for &dealer_id in &ids {
            let broadcasts = engines[&dealer_id].build_broadcasts();
            assert_eq!(broadcasts.len(), ids.len() - 1);
            for broadcast in &broadcasts {
                engines[&broadcast.to].verify_broadcast(broadcast).unwrap();
            }
        }
    }

    #[test]
    fn tampered_broadcast_proof_is_rejected() {
        let ids = participants(3);
        let threshold = 1;
        let secret = Fr::from(7u64);
        let (old_shares, old_commitments) = old_epoch(&ids, threshold, secret);
        let mpk = old_commitments[0];
        let (keys, addresses) = keyed_participants(&ids);
        let old_commitments_by_dealer: HashMap<NodeId, Vec<G2Point>> =
            ids.iter().map(|&id| (id, old_commitments.clone())).collect();

        let mut engines: Map<NodeId, ReshareEngine> = ids
            .iter()
            .map(|&id| {
                (
                    id,
                    engine(
                        "reshare-2",
                        1,
                        threshold,
                        ids.clone(),
                        id,
                        old_commitments_by_dealer.clone(),
                        mpk,
                        &keys,
                        &addresses,
                        1_000,
                        300,
                    ),
                )
            })
            .collect();

        let mut all_shares = Vec::new();
        for &id in &ids {
            let old_share = SecretScalar::new(old_shares[&id]);
            let (commitment, shares) = engines.get_mut(&id).unwrap().deal(&old_share, &mut OsRng).unwrap();
            for &peer in &ids {
                engines
                    .get_mut(&peer)
                    .unwrap()
                    .receive_commitment(commitment.clone())
                    .unwrap();
            }
            all_shares.extend(shares);
        }

        for share in all_shares {
            let recipient = share.recipient_id;
            let dealer = share.dealer_id;
            if let Some(ack) = engines.get_mut(&recipient).unwrap().receive_share(share).unwrap() {
                for &id in &ids {
                    engines.get_mut(&id).unwrap().receive_ack(ack.clone()).unwrap();
                }
                let _ = dealer;
            }
        }

        let dealer_id = ids[0];
        let mut broadcasts = engines[&dealer_id].build_broadcasts();
        let broadcast = broadcasts.first_mut().unwrap();
        if let Some(sibling) = broadcast.merkle_proof_for_this_recipient.siblings.first_mut() {
            sibling[0] ^= 0xff;
        }

        let result = engines[&broadcast.to].verify_broadcast(broadcast);
        assert!(matches!(result, Err(KmsError::InvalidAck(_))));
    }

    #[test]
    fn forged_ack_signature_is_rejected() {
        let ids = participants(3);
        let (keys, addresses) = keyed_participants(&ids);
        let mut dealer_engine = engine(
            "s",
            1,
            1,
            ids.clone(),
            ids[0],
            HashMap::new(),
            G2Point::identity(),
            &keys,
            &addresses,
            0,
            100,
        );
        let mut other_engine = engine(
            "s",
            1,
            1,
            ids.clone(),
            ids[1],
            HashMap::new(),
            G2Point::identity(),
            &keys,
            &addresses,
            0,
            100,
        );

        let mut ack = Acknowledgement {
            dealer_id: ids[0],
            player_id: ids[1],
            epoch: 1,
            share_hash: [1u8; 32],
            commitment_hash: [2u8; 32],
            signature: Vec::new(),
        };
        ack.signature = sign_message(&keys[&ids[1]], &ack_leaf_hash(&ack));
        ack.commitment_hash[0] ^= 0xff;

        let result = other_engine.receive_ack(ack.clone());
        assert!(matches!(result, Err(KmsError::InvalidAck(_))));
        let result = dealer_engine.receive_ack(ack);
        assert!(matches!(result, Err(KmsError::InvalidAck(_))));
    }

    #[test]
    fn completion_quorum_requires_matching_root() {
        let ids = participants(3);
        let (keys, addresses) = keyed_participants(&ids);
        let mut engine = engine(
            "s",
            1,
            1,
            ids.clone(),
            ids[0],
            HashMap::new(),
            G2Point::identity(),
            &keys,
            &addresses,
            0,
            100,
        );

        let root_a = [1u8; 32];
        let root_b = [2u8; 32];
        assert!(!engine.receive_completion(CompletionMessage {
            session_id: "s".to_string(),
            node_id: NodeId(1),
            epoch: 1,
            merkle_root: root_a,
            signature: vec![],
        }));
        assert!(!engine.receive_completion(CompletionMessage {
            session_id: "s".to_string(),
            node_id: NodeId(2),
            epoch: 1,
            merkle_root: root_b,
            signature: vec![],
        }));
        assert!(engine.receive_completion(CompletionMessage {
            session_id: "s".to_string(),
            node_id: NodeId(3),
            epoch: 1,
            merkle_root: root_a,
            signature: vec![],
        }));
    }
}
