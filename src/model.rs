//! Persisted and wire data types: key share versions, session state, and
//! the protocol messages exchanged between nodes (§5, §6).

use serde::{Deserialize, Serialize};

use crate::bls::{G2Point, SecretScalar};
use crate::merkle::MerkleProof;
use crate::node_id::NodeId;

/// Monotonically increasing epoch number. Epoch 0 is the DKG-produced key;
/// each successful reshare increments it by one.
pub type Epoch = i64;

/// One generation of a node's private key share, plus the public material
/// needed to verify it and others' shares against the same polynomial.
#[derive(Serialize, Deserialize)]
pub struct KeyShareVersion {
    pub epoch: Epoch,
    pub node_id: NodeId,
    /// This node's `P(node_id)`.
    pub private_share: SecretScalar,
    /// `[P(0)*G2, P(1)_coeff*G2, ...]`, shared by every honest participant.
    pub commitments: Vec<G2Point>,
    /// `P(0) * G2`, the group's long-lived master public key. Must be
    /// identical across every epoch produced by an honest reshare.
    pub master_public_key: G2Point,
    pub created_at_unix: i64,
    pub active: bool,
}

impl KeyShareVersion {
    pub fn public_commitment(&self) -> Option<&G2Point> {
        self.commitments.first()
    }
}

/// Explicit, not derived: `SecretScalar` has no `Clone` impl on purpose, so
/// cloning a `KeyShareVersion` goes through its `duplicate` escape hatch
/// rather than silently becoming available everywhere.
impl Clone for KeyShareVersion {
    fn clone(&self) -> Self {
        Self {
            epoch: self.epoch,
            node_id: self.node_id,
            private_share: self.private_share.duplicate(),
            commitments: self.commitments.clone(),
            master_public_key: self.master_public_key,
            created_at_unix: self.created_at_unix,
            active: self.active,
        }
    }
}

/// A signed acknowledgement that `player_id` received and verified a valid
/// share from `dealer_id` for the given `epoch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub dealer_id: NodeId,
    pub player_id: NodeId,
    pub epoch: Epoch,
    pub share_hash: [u8; 32],
    pub commitment_hash: [u8; 32],
    /// Recoverable ECDSA signature over the leaf encoding, by `player_id`.
    pub signature: Vec<u8>,
}

/// The phase of a running DKG or Reshare session, per the state machine in
/// §4.5/§4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Init,
    AwaitingShares,
    AwaitingAcks,
    Finalizing,
    Completed,
    TimedOut,
}

/// Which protocol a session is running; the two share a phase state machine
/// but differ in what Phase::Init does and what "shares" mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    Dkg,
    Reshare,
}

/// Crash-recoverable state for one running protocol session. Persisted after
/// every phase transition so a restarted node can resume instead of
/// restarting the protocol.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProtocolSessionState {
    pub session_id: String,
    pub kind: ProtocolKind,
    pub phase: Phase,
    pub epoch: Epoch,
    pub threshold: usize,
    pub participants: Vec<NodeId>,
    pub self_id: NodeId,
    /// This node's own dealt polynomial commitments, once Phase::Init has run.
    pub own_commitments: Option<Vec<G2Point>>,
    /// Shares received from other dealers, keyed by dealer id. Stored as
    /// canonical little-endian scalar bytes (see `bls::scalar_from_bytes`)
    /// rather than `blstrs::Scalar` directly, since the latter has no serde
    /// support.
    pub received_shares: std::collections::HashMap<NodeId, [u8; 32]>,
    /// Commitments received from other dealers, keyed by dealer id.
    pub received_commitments: std::collections::HashMap<NodeId, Vec<G2Point>>,
    /// Acknowledgements collected so far, keyed by (dealer, player).
    pub acks: Vec<Acknowledgement>,
    pub created_at_unix: i64,
    pub deadline_unix: i64,
}

/// Durable per-node bookkeeping: which operator this is and what the last
/// observed chain state was, used to decide whether a new session should be
/// started on the next block-boundary trigger.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    pub last_observed_epoch: Epoch,
    pub last_processed_block: u64,
}

/// Wire message: a dealer's per-player share, sent over the authenticated
/// transport (§4.3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareMessage {
    pub session_id: String,
    pub dealer_id: NodeId,
    pub recipient_id: NodeId,
    pub epoch: Epoch,
    /// Little-endian canonical scalar encoding; decoded with
    /// `bls::scalar_from_bytes`.
    pub share: [u8; 32],
}

/// Wire message: a dealer's public polynomial commitments, broadcast to all
/// participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentMessage {
    pub session_id: String,
    pub dealer_id: NodeId,
    pub epoch: Epoch,
    pub commitments: Vec<G2Point>,
}

/// Wire message carrying one acknowledgement, sent to every other
/// participant once a share has been verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcknowledgementMessage {
    pub session_id: String,
    pub ack: Acknowledgement,
}

/// Wire message: a node's attestation that it has finished the session and
/// its signature over the merkle root of all acknowledgements it collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub session_id: String,
    pub node_id: NodeId,
    pub epoch: Epoch,
    pub merkle_root: [u8; 32],
    pub signature: Vec<u8>,
}

/// Wire message used in Reshare Phase 4 (§4.6): the dealer-equivocation
/// defense. `from` vouches for its own dealing by broadcasting every ack it
/// collected plus, for each recipient individually, a merkle proof that the
/// recipient's own ack is among them. Unlike every other message in this
/// module, this one is not identical for every peer: `to` and
/// `merkle_proof_for_this_recipient` are specific to one recipient, so the
/// dealer cannot show different peers inconsistent ack sets without the
/// inconsistency surfacing as a proof that fails to verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentBroadcastMessage {
    pub session_id: String,
    pub from: NodeId,
    pub to: NodeId,
    pub epoch: Epoch,
    /// `from`'s own polynomial commitments for this epoch; checked against
    /// what the recipient already received from `from` in Phase 2.
    pub commitments: Vec<G2Point>,
    /// Every acknowledgement `from` has collected for its own dealing,
    /// sorted by `player_id`. The root `merkle_proof_for_this_recipient` is
    /// checked against is rebuilt from this field, not taken on faith.
    pub acks: Vec<Acknowledgement>,
    pub merkle_proof_for_this_recipient: MerkleProof,
}
