//! Auto-refreshing JWKS cache (§4.9).

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::KmsError;

/// Default refresh interval: frequent enough for a public JWKS endpoint's
/// key rotation window, infrequent enough not to hammer the provider.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct Snapshot {
    keys: JwkSet,
}

/// Holds the most recently fetched key set for one JWKS URL, refreshed on a
/// fixed interval. Reads are lock-free relative to a concurrent refresh: a
/// reader clones the `Arc<Snapshot>` under a brief read lock rather than
/// holding the lock for the whole lookup.
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            snapshot: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> Result<JwkSet, KmsError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| KmsError::InvalidAttestation(format!("jwks fetch failed: {e}")))?;
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| KmsError::InvalidAttestation(format!("jwks decode failed: {e}")))
    }

    /// Fetches and stores the current key set, replacing any prior snapshot.
    pub async fn refresh(&self) -> Result<(), KmsError> {
        let keys = self.fetch().await?;
        debug!(url = %self.url, key_count = keys.keys.len(), "refreshed jwks");
        *self.snapshot.write().await = Some(Arc::new(Snapshot { keys }));
        Ok(())
    }

    /// Spawns a background task that calls `refresh` on `interval`, logging
    /// (not propagating) failures so a transient provider outage doesn't
    /// kill the refresh loop.
    pub fn spawn_refresh_loop(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = cache.refresh().await {
                    warn!(url = %cache.url, %err, "jwks refresh failed, keeping prior snapshot");
                }
            }
        });
    }

    /// Keys whose `kid` matches `key_id` and whose algorithm matches `alg`,
    /// filtered because some providers issue multiple keys sharing a `kid`
    /// but differing in algorithm.
    pub async fn matching_keys(
        &self,
        key_id: &str,
        alg: jsonwebtoken::Algorithm,
    ) -> Result<Vec<jsonwebtoken::jwk::Jwk>, KmsError> {
        let guard = self.snapshot.read().await;
        let snapshot = guard.as_ref().ok_or_else(|| {
            KmsError::InvalidAttestation("jwks cache has not been populated yet".to_string())
        })?;
        let matches: Vec<_> = snapshot
            .keys
            .keys
            .iter()
            .filter(|jwk| {
                // Compared by Debug text, not the (distinct) `KeyAlgorithm`
                // enum, since their variant names line up 1:1 for every
                // algorithm this core accepts and it sidesteps having to
                // hand-maintain a `KeyAlgorithm -> Algorithm` match.
                jwk.common.key_id.as_deref() == Some(key_id)
                    && jwk.common.key_algorithm.map(|a| format!("{a:?}")) == Some(format!("{alg:?}"))
            })
            .cloned()
            .collect();
        if matches.is_empty() {
            return Err(KmsError::InvalidAttestation(format!(
                "no keys found in JWKS matching algorithm {alg:?}"
            )));
        }
        Ok(matches)
    }
}
