//! Durable storage for key share versions, node identity, and in-flight
//! protocol sessions (§4.8).

mod memory;
mod redis_store;
mod rocks;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use rocks::RocksStore;

use async_trait::async_trait;

use crate::error::KmsError;
use crate::model::{Epoch, KeyShareVersion, NodeState, ProtocolSessionState};

/// Current on-disk/on-wire schema version. Bumped whenever a persisted
/// type's encoding changes in a way older stores can't read.
pub const SCHEMA_VERSION: &str = "1";

/// Storage abstraction used by the key store, session engines, and startup
/// recovery. All methods must be safe to call concurrently; missing keys
/// return `Ok(None)`, never an error.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_key_share(&self, version: &KeyShareVersion) -> Result<(), KmsError>;
    async fn load_key_share(&self, epoch: Epoch) -> Result<Option<KeyShareVersion>, KmsError>;
    /// All known key share versions, ascending by epoch.
    async fn list_key_shares(&self) -> Result<Vec<KeyShareVersion>, KmsError>;
    async fn delete_key_share(&self, epoch: Epoch) -> Result<(), KmsError>;
    async fn set_active_epoch(&self, epoch: Epoch) -> Result<(), KmsError>;
    async fn get_active_epoch(&self) -> Result<Option<Epoch>, KmsError>;

    async fn save_node_state(&self, state: &NodeState) -> Result<(), KmsError>;
    async fn load_node_state(&self) -> Result<Option<NodeState>, KmsError>;

    async fn save_session(&self, session: &ProtocolSessionState) -> Result<(), KmsError>;
    async fn load_session(&self, session_id: &str) -> Result<Option<ProtocolSessionState>, KmsError>;
    async fn delete_session(&self, session_id: &str) -> Result<(), KmsError>;
    async fn list_sessions(&self) -> Result<Vec<ProtocolSessionState>, KmsError>;

    /// Idempotent: may be called more than once (e.g. on a double shutdown).
    async fn close(&self) -> Result<(), KmsError>;
    async fn health_check(&self) -> Result<(), KmsError>;
}

/// Startup recovery procedure shared by every `Store` backend (§4.8):
/// validate schema, refuse a mismatched operator identity, load the active
/// key share, and discard any in-flight session rather than attempt to
/// resume it mid-protocol.
pub async fn recover_on_startup(
    store: &dyn Store,
    expected_node_id: crate::node_id::NodeId,
    now_unix: i64,
) -> Result<Option<KeyShareVersion>, KmsError> {
    store.health_check().await?;

    if let Some(existing) = store.load_node_state().await? {
        if existing.node_id != expected_node_id {
            return Err(KmsError::Conflict(format!(
                "persisted node id {:?} does not match configured node id {:?}",
                existing.node_id, expected_node_id
            )));
        }
    }

    let active = match store.get_active_epoch().await? {
        Some(epoch) => store.load_key_share(epoch).await?,
        None => None,
    };

    for session in store.list_sessions().await? {
        if session.deadline_unix <= now_unix
            || !matches!(session.phase, crate::model::Phase::Completed)
        {
            store.delete_session(&session.session_id).await?;
        }
    }

    Ok(active)
}
