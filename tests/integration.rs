//! End-to-end scenarios spanning multiple modules: a node restarting
//! mid-protocol, and a full DKG driven entirely through the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use eigenx_kms_core::dkg::DkgEngine;
use eigenx_kms_core::error::KmsError;
use eigenx_kms_core::keystore::KeyStore;
use eigenx_kms_core::model::{NodeState, Phase, ProtocolKind};
use eigenx_kms_core::node::{BlockTrigger, NodeOrchestrator};
use eigenx_kms_core::node_id::{NodeId, OperatorAddress};
use eigenx_kms_core::persistence::{recover_on_startup, InMemoryStore, Store};
use eigenx_kms_core::shamir::recover_secret;
use eigenx_kms_core::transport::{HttpPeerTransport, PeerDirectory};
use k256::ecdsa::SigningKey;
use rand_core::OsRng;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

struct NullDirectory;

#[async_trait]
impl PeerDirectory for NullDirectory {
    async fn endpoint(&self, _peer: OperatorAddress) -> Result<String, KmsError> {
        Ok("http://127.0.0.1:1/unused".to_string())
    }
}

fn make_orchestrator(
    address: OperatorAddress,
    store: Arc<InMemoryStore>,
) -> NodeOrchestrator<InMemoryStore, HttpPeerTransport<NullDirectory>> {
    NodeOrchestrator::new(
        address,
        SigningKey::random(&mut OsRng),
        store,
        Arc::new(KeyStore::new()),
        Arc::new(HttpPeerTransport::new(NullDirectory)),
        Arc::new(eigenx_kms_core::attestation::Manager::new(None, None, None)),
        CancellationToken::new(),
    )
}

/// Scenario 5: a session saved mid-protocol (Phase::AwaitingShares) is
/// garbage-collected on restart, while an already-active key share survives
/// restart with an identical private share.
#[tokio::test]
async fn restart_mid_protocol_gcs_incomplete_session_and_restores_active_share() {
    let store = InMemoryStore::new();
    let node_id = NodeId(42);

    let mut engine = DkgEngine::new(
        "sess-restart".to_string(),
        0,
        1,
        vec![node_id, NodeId(2), NodeId(3)],
        node_id,
        HashMap::new(),
        SigningKey::random(&mut OsRng),
        1_000,
        300,
    );
    let (_commitment, _shares) = engine.deal(&mut OsRng).unwrap();
    assert_eq!(engine.session.phase, Phase::AwaitingShares);
    store.save_session(&engine.session).await.unwrap();

    let version = eigenx_kms_core::model::KeyShareVersion {
        epoch: 0,
        node_id,
        private_share: eigenx_kms_core::bls::SecretScalar::new(blstrs::Scalar::from(7u64)),
        commitments: vec![eigenx_kms_core::bls::G2Point::identity()],
        master_public_key: eigenx_kms_core::bls::G2Point::identity(),
        created_at_unix: 500,
        active: true,
    };
    store.save_key_share(&version).await.unwrap();
    store.set_active_epoch(0).await.unwrap();
    store
        .save_node_state(&NodeState {
            node_id,
            last_observed_epoch: 0,
            last_processed_block: 10,
        })
        .await
        .unwrap();

    let recovered = recover_on_startup(&store, node_id, 2_000).await.unwrap();
    let recovered = recovered.expect("active key share must survive restart");
    assert_eq!(recovered.epoch, 0);
    assert_eq!(
        recovered.private_share.expose_secret(),
        version.private_share.expose_secret()
    );

    assert!(store.list_sessions().await.unwrap().is_empty());
}

/// Scenario 3 (orchestrator-level): three nodes run a full DKG through
/// `NodeOrchestrator`, each independently reaching the same recoverable
/// secret and master public key.
#[tokio::test]
async fn dkg_round_trip_via_orchestrator() {
    let addresses: Vec<OperatorAddress> = vec![[1u8; 20], [2u8; 20], [3u8; 20]];
    let mut orchestrators = HashMap::new();
    let mut ids = Vec::new();
    for &address in &addresses {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = make_orchestrator(address, store);
        let id = orchestrator.node_id();
        ids.push(id);
        orchestrators.insert(id, orchestrator);
    }

    let participant_addresses: HashMap<NodeId, OperatorAddress> =
        ids.iter().copied().zip(addresses.iter().copied()).collect();

    for orchestrator in orchestrators.values() {
        orchestrator.recover(1_000).await.unwrap();
        orchestrator
            .handle_block_boundary(
                BlockTrigger {
                    block_number: 1,
                    epoch: 0,
                    threshold: 1,
                    participants: ids.clone(),
                    participant_addresses: participant_addresses.clone(),
                },
                1_000,
            )
            .await
            .unwrap();
    }

    let mut all_commitments = Vec::new();
    let mut all_shares = Vec::new();
    for &id in &ids {
        let (commitment, shares) = orchestrators
            .get(&id)
            .unwrap()
            .deal_own_dkg_contribution(&mut OsRng)
            .await
            .unwrap();
        all_commitments.push(commitment);
        all_shares.extend(shares);
    }

    for commitment in &all_commitments {
        for &id in &ids {
            orchestrators
                .get(&id)
                .unwrap()
                .handle_dkg_commitment(commitment.clone())
                .await
                .unwrap();
        }
    }

    let mut acks = Vec::new();
    for share in all_shares {
        let recipient = share.recipient_id;
        if let Some(ack) = orchestrators
            .get(&recipient)
            .unwrap()
            .handle_dkg_share(share)
            .await
            .unwrap()
        {
            acks.push(ack);
        }
    }
    for ack in &acks {
        for &id in &ids {
            orchestrators
                .get(&id)
                .unwrap()
                .handle_dkg_ack(ack.clone())
                .await
                .unwrap();
        }
    }

    let mut shares_by_id = HashMap::new();
    let mut master_keys = Vec::new();
    for &id in &ids {
        let epoch = orchestrators
            .get(&id)
            .unwrap()
            .try_finalize_dkg(1_000)
            .await
            .unwrap()
            .expect("threshold of 1 ack per dealer must be met with 3 honest participants");
        assert_eq!(epoch, 0);

        let key_store = orchestrators.get(&id).unwrap().key_store();
        let private_share = key_store.get_active_private_share().unwrap();
        let commitments = key_store.get_active_commitments().unwrap();
        master_keys.push(commitments[0]);
        shares_by_id.insert(id, *private_share.expose_secret());
    }

    for window in master_keys.windows(2) {
        assert_eq!(window[0], window[1], "every node must agree on the master public key");
    }

    let subset: HashMap<NodeId, blstrs::Scalar> = ids
        .iter()
        .take(2)
        .map(|&id| (id, shares_by_id[&id]))
        .collect();
    // threshold 1 needs 2 shares to recover; any 2-of-3 subset must agree.
    let secret = recover_secret(&subset).unwrap();
    let other_subset: HashMap<NodeId, blstrs::Scalar> = [ids[1], ids[2]]
        .into_iter()
        .map(|id| (id, shares_by_id[&id]))
        .collect();
    assert_eq!(recover_secret(&other_subset).unwrap(), secret);
}

/// `ProtocolKind` round-trips through JSON the same way every other
/// persisted enum does, guarding the persistence schema against silent
/// representation drift.
#[test]
fn protocol_kind_serializes_stably() {
    let encoded = serde_json::to_string(&ProtocolKind::Reshare).unwrap();
    assert_eq!(encoded, "\"Reshare\"");
}

#[test]
fn shamir_recovery_matches_literal_scenario() {
    use blstrs::Scalar as Fr;
    use eigenx_kms_core::node_id::NodeId;
    use eigenx_kms_core::polynomial::{evaluate_polynomial, Polynomial};

    let secret = Fr::from(12345u64);
    let poly = Polynomial::generate(secret, 2, &mut OsRng);
    let ids: Vec<NodeId> = (1..=5).map(NodeId).collect();
    let shares: HashMap<NodeId, Fr> = ids
        .iter()
        .map(|&id| (id, evaluate_polynomial(&poly, id.to_scalar())))
        .collect();

    let subset_a: HashMap<NodeId, Fr> = [NodeId(1), NodeId(3), NodeId(5)]
        .into_iter()
        .map(|id| (id, shares[&id]))
        .collect();
    let subset_b: HashMap<NodeId, Fr> = [NodeId(2), NodeId(4), NodeId(5)]
        .into_iter()
        .map(|id| (id, shares[&id]))
        .collect();

    assert_eq!(recover_secret(&subset_a).unwrap(), secret);
    assert_eq!(recover_secret(&subset_b).unwrap(), secret);
}
