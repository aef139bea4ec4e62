//! Node orchestrator: ties block-boundary triggers to protocol session
//! lifecycle, the key store, and durable persistence (§2, §5).
//!
//! The chain observer that decides *when* a new epoch is due, and the HTTP
//! router that delivers inbound peer messages to this orchestrator, are both
//! excluded outer-layer collaborators (§6). This module owns everything
//! downstream of "a block boundary fired" and "a message arrived".

use std::collections::HashMap;
use std::sync::Arc;

use k256::ecdsa::SigningKey;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attestation::jwt::AttestationClaims;
use crate::attestation::{Manager as AttestationManager, VerificationRequest};
use crate::bls::{G1Point, SecretScalar};
use crate::dkg::DkgEngine;
use crate::error::KmsError;
use crate::keystore::KeyStore;
use crate::merkle::MerkleTree;
use crate::model::{
    Acknowledgement, CommitmentBroadcastMessage, CommitmentMessage, CompletionMessage, Epoch,
    NodeState, ShareMessage,
};
use crate::node_id::{NodeId, OperatorAddress};
use crate::persistence::{recover_on_startup, Store};
use crate::reshare::ReshareEngine;
use crate::transport::{sign_message, PeerTransport};

/// Per-protocol-session timeout. The data model calls this chain-dependent
/// and "on the order of minutes"; five minutes is a conservative default a
/// deployment can override.
pub const DEFAULT_SESSION_TIMEOUT_SECONDS: i64 = 5 * 60;

/// What a block-boundary trigger tells the orchestrator. Populated by the
/// excluded chain observer: it alone knows the on-chain operator set and
/// epoch schedule.
pub struct BlockTrigger {
    pub block_number: u64,
    pub epoch: Epoch,
    pub threshold: usize,
    pub participants: Vec<NodeId>,
    /// Resolved `NodeId -> OperatorAddress` for every participant, used to
    /// verify incoming acknowledgement signatures. `NodeId::from_address` is
    /// one-way, so this directory has to come from whoever already knows the
    /// on-chain operator set.
    pub participant_addresses: HashMap<NodeId, OperatorAddress>,
}

/// The two session kinds the orchestrator can be driving at once, never
/// both: a node is either generating its first key or reshuffling an
/// existing one.
enum ActiveSession {
    None,
    Dkg(DkgEngine),
    Reshare(ReshareEngine),
}

/// Ties together identity, the key store, durable persistence, the peer
/// transport, and the attestation verifier into one node process.
pub struct NodeOrchestrator<S, T> {
    node_id: NodeId,
    address: OperatorAddress,
    signing_key: SigningKey,
    store: Arc<S>,
    key_store: Arc<KeyStore>,
    transport: Arc<T>,
    attestation: Arc<AttestationManager>,
    cancel: CancellationToken,
    session_timeout_seconds: i64,
    active: Mutex<ActiveSession>,
}

impl<S: Store, T: PeerTransport> NodeOrchestrator<S, T> {
    pub fn new(
        address: OperatorAddress,
        signing_key: SigningKey,
        store: Arc<S>,
        key_store: Arc<KeyStore>,
        transport: Arc<T>,
        attestation: Arc<AttestationManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id: NodeId::from_address(&address),
            address,
            signing_key,
            store,
            key_store,
            transport,
            attestation,
            cancel,
            session_timeout_seconds: DEFAULT_SESSION_TIMEOUT_SECONDS,
            active: Mutex::new(ActiveSession::None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The key store backing this node, for callers that need direct
    /// queries (e.g. serving `GET /pubkey`).
    pub fn key_store(&self) -> &KeyStore {
        self.key_store.as_ref()
    }

    /// Startup recovery (§4.8): validates the persisted operator identity,
    /// loads the active key share into the key store, and discards any
    /// session that didn't reach `Completed` before the process died.
    pub async fn recover(&self, now_unix: i64) -> Result<(), KmsError> {
        let active = recover_on_startup(self.store.as_ref(), self.node_id, now_unix).await?;
        if let Some(version) = active {
            let epoch = version.epoch;
            self.key_store.add_version(version);
            self.key_store.set_active(epoch)?;
            info!(epoch, "recovered active key share");
        } else {
            info!("no active key share found at startup");
        }

        if self.store.load_node_state().await?.is_none() {
            self.store
                .save_node_state(&NodeState {
                    node_id: self.node_id,
                    last_observed_epoch: self.key_store.get_active_epoch().unwrap_or(-1),
                    last_processed_block: 0,
                })
                .await?;
        }
        Ok(())
    }

    /// Reacts to a block-boundary trigger from the chain observer: starts a
    /// DKG session if this node has no active key yet, or a Reshare session
    /// if the trigger's epoch is newer than what this node last observed.
    /// Does nothing if there is already a session in flight or the trigger
    /// doesn't call for a new one.
    pub async fn handle_block_boundary(
        &self,
        trigger: BlockTrigger,
        now_unix: i64,
    ) -> Result<(), KmsError> {
        if self.cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }

        let mut guard = self.active.lock().await;
        if !matches!(*guard, ActiveSession::None) {
            warn!(block = trigger.block_number, "session already in flight, ignoring trigger");
            return Ok(());
        }

        let node_state = self
            .store
            .load_node_state()
            .await?
            .unwrap_or(NodeState {
                node_id: self.node_id,
                last_observed_epoch: -1,
                last_processed_block: 0,
            });

        if trigger.epoch <= node_state.last_observed_epoch {
            return Ok(());
        }

        let session_id = format!("epoch-{}-block-{}", trigger.epoch, trigger.block_number);

        if self.key_store.get_active_epoch().is_none() {
            let engine = DkgEngine::new(
                session_id,
                trigger.epoch,
                trigger.threshold,
                trigger.participants,
                self.node_id,
                trigger.participant_addresses,
                self.signing_key.clone(),
                now_unix,
                self.session_timeout_seconds,
            );
            self.store.save_session(&engine.session).await?;
            *guard = ActiveSession::Dkg(engine);
        } else {
            let old_commitments = self.collect_old_commitments(&trigger.participants)?;
            let mpk = self
                .key_store
                .get_active_commitments()
                .and_then(|c| c.first().copied())
                .ok_or_else(|| KmsError::Conflict("no active commitments to reshare from".to_string()))?;
            let engine = ReshareEngine::new(
                session_id,
                trigger.epoch,
                trigger.threshold,
                trigger.participants,
                self.node_id,
                old_commitments,
                mpk,
                trigger.participant_addresses,
                self.signing_key.clone(),
                now_unix,
                self.session_timeout_seconds,
            )?;
            self.store.save_session(&engine.session).await?;
            *guard = ActiveSession::Reshare(engine);
        }

        self.store
            .save_node_state(&NodeState {
                node_id: self.node_id,
                last_observed_epoch: trigger.epoch,
                last_processed_block: trigger.block_number,
            })
            .await?;
        Ok(())
    }

    /// Deals this node's own contribution for the DKG session just started
    /// by `handle_block_boundary`, returning the commitment broadcast and
    /// per-recipient shares for the caller to deliver over the transport
    /// (address resolution from `NodeId` to `OperatorAddress` belongs to the
    /// chain-registry collaborator that supplied the `BlockTrigger`).
    pub async fn deal_own_dkg_contribution<R: rand_core::RngCore>(
        &self,
        rng: &mut R,
    ) -> Result<(CommitmentMessage, Vec<ShareMessage>), KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Dkg(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no dkg session in flight".to_string()));
        };
        let result = engine.deal(rng)?;
        self.store.save_session(&engine.session).await?;
        Ok(result)
    }

    /// Deals this node's own contribution for the Reshare session just
    /// started by `handle_block_boundary`, scaling this node's currently
    /// active share by its Lagrange coefficient as the Reshare engine
    /// requires.
    pub async fn deal_own_reshare_contribution<R: rand_core::RngCore>(
        &self,
        rng: &mut R,
    ) -> Result<(CommitmentMessage, Vec<ShareMessage>), KmsError> {
        let old_share = self
            .key_store
            .get_active_private_share()
            .ok_or_else(|| KmsError::Conflict("no active share to reshare".to_string()))?;
        let mut guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        let result = engine.deal(&old_share, rng)?;
        self.store.save_session(&engine.session).await?;
        Ok(result)
    }

    /// Every reshare dealer attests its old-epoch commitments are the same
    /// ones this node already has recorded; a production deployment learns
    /// these from peers' `GET /pubkey`, which is outside this module's
    /// responsibility, so this stub seeds every participant with this
    /// node's own view (valid whenever the caller has already fetched and
    /// verified each peer's published commitments through that channel).
    fn collect_old_commitments(
        &self,
        participants: &[NodeId],
    ) -> Result<HashMap<NodeId, Vec<crate::bls::G2Point>>, KmsError> {
        let commitments = self
            .key_store
            .get_active_commitments()
            .ok_or_else(|| KmsError::Conflict("no active commitments available".to_string()))?;
        Ok(participants.iter().map(|&id| (id, commitments.clone())).collect())
    }

    pub async fn handle_dkg_commitment(&self, message: CommitmentMessage) -> Result<(), KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Dkg(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no dkg session in flight".to_string()));
        };
        engine.receive_commitment(message)?;
        self.store.save_session(&engine.session).await
    }

    pub async fn handle_dkg_share(&self, message: ShareMessage) -> Result<Option<Acknowledgement>, KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Dkg(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no dkg session in flight".to_string()));
        };
        let ack = engine.receive_share(message)?;
        self.store.save_session(&engine.session).await?;
        Ok(ack)
    }

    pub async fn handle_dkg_ack(&self, ack: Acknowledgement) -> Result<(), KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Dkg(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no dkg session in flight".to_string()));
        };
        engine.receive_ack(ack)?;
        self.store.save_session(&engine.session).await
    }

    /// Attempts to finalize the in-flight DKG session, and on success
    /// persists and activates the resulting key share directly (DKG has no
    /// Phase-4 broadcast gate, unlike Reshare).
    pub async fn try_finalize_dkg(&self, now_unix: i64) -> Result<Option<Epoch>, KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Dkg(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no dkg session in flight".to_string()));
        };
        // Catches the session up to `AwaitingAcks` if it's still sitting in
        // an earlier bookkeeping phase; `try_finalize`'s own threshold check
        // is what actually decides whether there's enough to finalize.
        engine.advance_bookkeeping_phase()?;
        engine.advance_bookkeeping_phase()?;
        let version = match engine.try_finalize(now_unix) {
            Ok(version) => version,
            Err(KmsError::Threshold { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let session_id = engine.session.session_id.clone();

        self.store.save_key_share(&version).await?;
        let epoch = version.epoch;
        self.key_store.add_version(version);
        self.key_store.set_active(epoch)?;
        self.store.set_active_epoch(epoch).await?;
        self.store.delete_session(&session_id).await?;
        *guard = ActiveSession::None;
        info!(epoch, "dkg completed, key share activated");
        Ok(Some(epoch))
    }

    pub async fn handle_reshare_commitment(&self, message: CommitmentMessage) -> Result<(), KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        engine.receive_commitment(message)?;
        self.store.save_session(&engine.session).await
    }

    pub async fn handle_reshare_share(&self, message: ShareMessage) -> Result<Option<Acknowledgement>, KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        let ack = engine.receive_share(message)?;
        self.store.save_session(&engine.session).await?;
        Ok(ack)
    }

    pub async fn handle_reshare_ack(&self, ack: Acknowledgement) -> Result<(), KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        engine.receive_ack(ack)?;
        self.store.save_session(&engine.session).await
    }

    /// Phase 4: builds this node's per-recipient broadcasts and signs each
    /// one individually, ready for the transport to fan out to every peer.
    pub async fn build_reshare_broadcasts(
        &self,
    ) -> Result<Vec<(CommitmentBroadcastMessage, Vec<u8>)>, KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        engine
            .build_broadcasts()
            .into_iter()
            .map(|broadcast| {
                let payload = serde_json::to_vec(&broadcast)
                    .map_err(|e| KmsError::Conflict(format!("failed to encode broadcast: {e}")))?;
                let signature = sign_message(&self.signing_key, &payload);
                Ok((broadcast, signature))
            })
            .collect()
    }

    pub async fn verify_reshare_broadcast(&self, broadcast: &CommitmentBroadcastMessage) -> Result<(), KmsError> {
        let guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &*guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        engine.verify_broadcast(broadcast)
    }

    /// Finalizes the reshare into a pending (not yet active) version; the
    /// pending version only becomes active once `receive_reshare_completion`
    /// reports quorum.
    pub async fn try_finalize_reshare(&self, now_unix: i64) -> Result<Option<Epoch>, KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        engine.advance_bookkeeping_phase()?;
        engine.advance_bookkeeping_phase()?;
        let version = match engine.try_finalize(now_unix) {
            Ok(version) => version,
            Err(KmsError::Threshold { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let epoch = version.epoch;
        // Persisted now, while still inactive, so a crash between
        // finalizing and reaching completion quorum doesn't lose the share.
        self.store.save_key_share(&version).await?;
        self.key_store.set_pending(version);
        Ok(Some(epoch))
    }

    /// Records a peer's completion signature; on quorum, activates the
    /// pending version atomically and deletes the now-finished session.
    pub async fn receive_reshare_completion(&self, message: CompletionMessage) -> Result<bool, KmsError> {
        let mut guard = self.active.lock().await;
        let ActiveSession::Reshare(engine) = &mut *guard else {
            return Err(KmsError::Conflict("no reshare session in flight".to_string()));
        };
        let quorum_reached = engine.receive_completion(message);
        if !quorum_reached {
            return Ok(false);
        }
        let session_id = engine.session.session_id.clone();

        let epoch = self.key_store.activate_pending()?;
        self.store.set_active_epoch(epoch).await?;
        self.store.delete_session(&session_id).await?;
        *guard = ActiveSession::None;
        info!(epoch, "reshare completed, pending key share activated");
        Ok(true)
    }

    /// Side-exits whatever session is in flight if its deadline has passed,
    /// freeing the orchestrator to react to the next trigger.
    pub async fn check_session_timeout(&self, now_unix: i64) -> bool {
        let mut guard = self.active.lock().await;
        match &mut *guard {
            ActiveSession::Dkg(engine) => engine.check_timeout(now_unix),
            ActiveSession::Reshare(engine) => engine.check_timeout(now_unix),
            ActiveSession::None => false,
        }
    }

    /// The partial-signature primitive the (excluded) application-secret
    /// route calls after a successful attestation: signs `message` under
    /// this node's currently active share.
    pub fn sign_partial(&self, message: &[u8]) -> Result<G1Point, KmsError> {
        let share: SecretScalar = self
            .key_store
            .get_active_private_share()
            .ok_or_else(|| KmsError::Conflict("no active key share to sign with".to_string()))?;
        Ok(crate::bls::sign_g1(share.expose_secret(), message))
    }

    pub async fn verify_attestation(
        &self,
        request: VerificationRequest<'_>,
    ) -> Result<AttestationClaims, KmsError> {
        self.attestation.verify(request).await
    }

    /// Signs an outbound message under this node's transport identity,
    /// ready to hand to the `PeerTransport`.
    pub fn sign_for_transport(&self, payload: Vec<u8>) -> crate::transport::SignedMessage {
        crate::transport::SignedMessage::sign(&self.signing_key, self.address, payload)
    }

    pub fn transport(&self) -> &T {
        self.transport.as_ref()
    }

    pub fn merkle_root_of_own_acks(&self, acks: &[Acknowledgement]) -> [u8; 32] {
        MerkleTree::build(acks).root()
    }
}
