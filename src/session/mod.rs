//! Protocol session lifecycle: phase transitions, deadlines, and the
//! crash-recoverable state the DKG/Reshare engines drive (§4.5, §4.6, §5).

use std::collections::HashMap;

use crate::error::KmsError;
use crate::model::{Acknowledgement, Epoch, Phase, ProtocolKind, ProtocolSessionState};
use crate::node_id::NodeId;

/// Builds a fresh session in `Phase::Init`.
pub fn new_session(
    session_id: String,
    kind: ProtocolKind,
    epoch: Epoch,
    threshold: usize,
    participants: Vec<NodeId>,
    self_id: NodeId,
    now_unix: i64,
    timeout_seconds: i64,
) -> ProtocolSessionState {
    ProtocolSessionState {
        session_id,
        kind,
        phase: Phase::Init,
        epoch,
        threshold,
        participants,
        self_id,
        own_commitments: None,
        received_shares: HashMap::new(),
        received_commitments: HashMap::new(),
        acks: Vec::new(),
        created_at_unix: now_unix,
        deadline_unix: now_unix + timeout_seconds,
    }
}

/// Valid forward transitions; `TimedOut` is reachable from any non-terminal
/// phase but is handled separately via `check_deadline`.
fn next_phase(current: Phase) -> Option<Phase> {
    match current {
        Phase::Init => Some(Phase::AwaitingShares),
        Phase::AwaitingShares => Some(Phase::AwaitingAcks),
        Phase::AwaitingAcks => Some(Phase::Finalizing),
        Phase::Finalizing => Some(Phase::Completed),
        Phase::Completed | Phase::TimedOut => None,
    }
}

/// Advances `session` to the next phase in sequence. Callers persist the
/// session immediately after a successful call, per the ordering guarantee
/// that phase transitions are persisted before leaving the phase.
pub fn advance(session: &mut ProtocolSessionState) -> Result<(), KmsError> {
    match next_phase(session.phase) {
        Some(phase) => {
            session.phase = phase;
            Ok(())
        }
        None => Err(KmsError::Conflict(format!(
            "session {} has no forward transition from {:?}",
            session.session_id, session.phase
        ))),
    }
}

/// Side-exit to `TimedOut` if `now_unix` has passed the session's deadline.
/// Idempotent: calling on an already-terminal session is a no-op.
pub fn check_deadline(session: &mut ProtocolSessionState, now_unix: i64) -> bool {
    if matches!(session.phase, Phase::Completed | Phase::TimedOut) {
        return false;
    }
    if now_unix >= session.deadline_unix {
        session.phase = Phase::TimedOut;
        return true;
    }
    false
}

/// Records an acknowledgement from `ack.player_id` vouching for
/// `ack.dealer_id`, deduplicating on (dealer, player) so replays don't
/// double-count toward the threshold.
pub fn record_ack(session: &mut ProtocolSessionState, ack: Acknowledgement) {
    let already_present = session
        .acks
        .iter()
        .any(|a| a.dealer_id == ack.dealer_id && a.player_id == ack.player_id);
    if !already_present {
        session.acks.push(ack);
    }
}

/// Number of distinct players who have acknowledged `dealer`.
pub fn ack_count_for_dealer(session: &ProtocolSessionState, dealer: NodeId) -> usize {
    session
        .acks
        .iter()
        .filter(|a| a.dealer_id == dealer)
        .count()
}

/// The set of dealers that at least `threshold` distinct players have
/// acknowledged — the `J` set in §4.5/§4.6.
pub fn finalized_dealers(session: &ProtocolSessionState, threshold: usize) -> Vec<NodeId> {
    session
        .received_commitments
        .keys()
        .copied()
        .filter(|&dealer| ack_count_for_dealer(session, dealer) >= threshold)
        .collect()
}
