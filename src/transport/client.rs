//! HTTP peer transport: delivers signed messages to other nodes over HTTP,
//! with bounded exponential backoff and cooperative cancellation (§4.4).

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::KmsError;
use crate::node_id::OperatorAddress;
use crate::transport::signer::SignedMessage;

/// Retry policy: 5 attempts total, starting at 100ms and doubling up to a
/// 5-second cap.
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: f64 = 2.0;
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Abstracts peer-to-peer message delivery so the DKG/Reshare engines can be
/// tested against an in-memory transport instead of real HTTP.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(
        &self,
        peer: OperatorAddress,
        message: SignedMessage,
        cancel: &CancellationToken,
    ) -> Result<(), KmsError>;

    /// Best-effort fan-out for the broadcast endpoints of §4.4
    /// (`broadcast_dkg_commitments`, `broadcast_reshare_commitments`,
    /// `broadcast_completion`, `broadcast_commitments_with_proofs`): a single
    /// delivery attempt per `(peer, message)` pair, `self_address` always
    /// skipped, and a failed peer logged rather than propagated so one
    /// unreachable node can't block the others from receiving theirs.
    async fn broadcast(
        &self,
        self_address: OperatorAddress,
        messages: Vec<(OperatorAddress, SignedMessage)>,
        cancel: &CancellationToken,
    );
}

/// Maps an operator address to the base URL of the node it controls.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn endpoint(&self, peer: OperatorAddress) -> Result<String, KmsError>;
}

/// HTTP-backed `PeerTransport`, retrying transient failures with capped
/// exponential backoff and bailing out early if `cancel` fires.
pub struct HttpPeerTransport<D> {
    client: reqwest::Client,
    directory: D,
}

impl<D: PeerDirectory> HttpPeerTransport<D> {
    pub fn new(directory: D) -> Self {
        Self {
            client: reqwest::Client::new(),
            directory,
        }
    }

    async fn deliver_once(&self, url: &str, message: &SignedMessage) -> Result<(), KmsError> {
        let response = self
            .client
            .post(url)
            .json(message)
            .send()
            .await
            .map_err(|e| KmsError::Persistence(format!("transport send failed: {e}")))?;
        if !response.status().is_success() {
            return Err(KmsError::Persistence(format!(
                "peer responded with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<D: PeerDirectory> PeerTransport for HttpPeerTransport<D> {
    async fn send(
        &self,
        peer: OperatorAddress,
        message: SignedMessage,
        cancel: &CancellationToken,
    ) -> Result<(), KmsError> {
        let url = self.directory.endpoint(peer).await?;
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(KmsError::Cancelled);
            }
            match self.deliver_once(&url, &message).await {
                Ok(()) => {
                    debug!(attempt, %url, "delivered message");
                    return Ok(());
                }
                Err(err) if attempt == MAX_ATTEMPTS => {
                    warn!(attempt, %url, %err, "giving up on message delivery");
                    return Err(err);
                }
                Err(err) => {
                    warn!(attempt, %url, %err, "retrying message delivery");
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = cancel.cancelled() => return Err(KmsError::Cancelled),
                    }
                    let next_millis = (backoff.as_secs_f64() * BACKOFF_FACTOR).min(MAX_BACKOFF.as_secs_f64());
                    backoff = Duration::from_secs_f64(next_millis);
                }
            }
        }
        unreachable!("loop always returns by the final attempt")
    }

    async fn broadcast(
        &self,
        self_address: OperatorAddress,
        messages: Vec<(OperatorAddress, SignedMessage)>,
        cancel: &CancellationToken,
    ) {
        for (peer, message) in messages {
            if peer == self_address {
                continue;
            }
            if cancel.is_cancelled() {
                return;
            }
            let url = match self.directory.endpoint(peer).await {
                Ok(url) => url,
                Err(err) => {
                    warn!(?peer, %err, "broadcast endpoint lookup failed, skipping peer");
                    continue;
                }
            };
            if let Err(err) = self.deliver_once(&url, &message).await {
                warn!(?peer, %err, "broadcast delivery failed, skipping peer");
            }
        }
    }
}
