//! Redis-backed shared `Store` (§4.8).
//!
//! Redis has no native prefix iteration, so each namespace keeps a side
//! index set (`keyshares:index`, `sessions:index`) alongside the values;
//! listing reads the index then fetches each member, opportunistically
//! dropping index entries whose value has since disappeared.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::KmsError;
use crate::model::{Epoch, KeyShareVersion, NodeState, ProtocolSessionState};
use crate::persistence::{Store, SCHEMA_VERSION};

const SCHEMA_KEY: &str = "metadata:schema_version";
const ACTIVE_EPOCH_KEY: &str = "active:version";
const NODE_STATE_KEY: &str = "nodestate:main";
const KEY_SHARE_INDEX: &str = "keyshares:index";
const SESSION_INDEX: &str = "sessions:index";

fn key_share_key(epoch: Epoch) -> String {
    format!("keyshare:{epoch}")
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn to_err(e: redis::RedisError) -> KmsError {
    KmsError::Persistence(format!("redis error: {e}"))
}

pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, KmsError> {
        let client = redis::Client::open(url).map_err(to_err)?;
        let manager = client.get_connection_manager().await.map_err(to_err)?;
        let mut store = Self { manager };
        let exists: bool = store.manager.exists(SCHEMA_KEY).await.map_err(to_err)?;
        if !exists {
            let () = store
                .manager
                .set(SCHEMA_KEY, SCHEMA_VERSION)
                .await
                .map_err(to_err)?;
        }
        Ok(store)
    }

    /// Fetches every indexed member's value, dropping any index entry whose
    /// value key no longer exists.
    async fn list_indexed<T: serde::de::DeserializeOwned>(
        &self,
        index_key: &str,
    ) -> Result<Vec<T>, KmsError> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = conn.smembers(index_key).await.map_err(to_err)?;
        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let raw: Option<String> = conn.get(&member).await.map_err(to_err)?;
            match raw {
                Some(json) => {
                    let value: T = serde_json::from_str(&json)
                        .map_err(|e| KmsError::Persistence(format!("decode {member}: {e}")))?;
                    out.push(value);
                }
                None => {
                    let _: () = conn.srem(index_key, &member).await.map_err(to_err)?;
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn save_key_share(&self, version: &KeyShareVersion) -> Result<(), KmsError> {
        let key = key_share_key(version.epoch);
        let json = serde_json::to_string(version)
            .map_err(|e| KmsError::Persistence(format!("encode key share: {e}")))?;
        let mut conn = self.manager.clone();
        let _: () = conn.set(&key, json).await.map_err(to_err)?;
        let _: () = conn.sadd(KEY_SHARE_INDEX, &key).await.map_err(to_err)?;
        Ok(())
    }

    async fn load_key_share(&self, epoch: Epoch) -> Result<Option<KeyShareVersion>, KmsError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key_share_key(epoch)).await.map_err(to_err)?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| KmsError::Persistence(format!("decode key share: {e}")))
        })
        .transpose()
    }

    async fn list_key_shares(&self) -> Result<Vec<KeyShareVersion>, KmsError> {
        let mut versions: Vec<KeyShareVersion> = self.list_indexed(KEY_SHARE_INDEX).await?;
        versions.sort_by_key(|v| v.epoch);
        Ok(versions)
    }

    async fn delete_key_share(&self, epoch: Epoch) -> Result<(), KmsError> {
        let key = key_share_key(epoch);
        let mut conn = self.manager.clone();
        let _: () = conn.del(&key).await.map_err(to_err)?;
        let _: () = conn.srem(KEY_SHARE_INDEX, &key).await.map_err(to_err)?;
        Ok(())
    }

    async fn set_active_epoch(&self, epoch: Epoch) -> Result<(), KmsError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set(ACTIVE_EPOCH_KEY, epoch)
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn get_active_epoch(&self) -> Result<Option<Epoch>, KmsError> {
        let mut conn = self.manager.clone();
        conn.get(ACTIVE_EPOCH_KEY).await.map_err(to_err)
    }

    async fn save_node_state(&self, state: &NodeState) -> Result<(), KmsError> {
        let json = serde_json::to_string(state)
            .map_err(|e| KmsError::Persistence(format!("encode node state: {e}")))?;
        let mut conn = self.manager.clone();
        let _: () = conn.set(NODE_STATE_KEY, json).await.map_err(to_err)?;
        Ok(())
    }

    async fn load_node_state(&self) -> Result<Option<NodeState>, KmsError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(NODE_STATE_KEY).await.map_err(to_err)?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| KmsError::Persistence(format!("decode node state: {e}")))
        })
        .transpose()
    }

    async fn save_session(&self, session: &ProtocolSessionState) -> Result<(), KmsError> {
        let key = session_key(&session.session_id);
        let json = serde_json::to_string(session)
            .map_err(|e| KmsError::Persistence(format!("encode session: {e}")))?;
        let mut conn = self.manager.clone();
        let _: () = conn.set(&key, json).await.map_err(to_err)?;
        let _: () = conn.sadd(SESSION_INDEX, &key).await.map_err(to_err)?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<ProtocolSessionState>, KmsError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(session_key(session_id)).await.map_err(to_err)?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| KmsError::Persistence(format!("decode session: {e}")))
        })
        .transpose()
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), KmsError> {
        let key = session_key(session_id);
        let mut conn = self.manager.clone();
        let _: () = conn.del(&key).await.map_err(to_err)?;
        let _: () = conn.srem(SESSION_INDEX, &key).await.map_err(to_err)?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<ProtocolSessionState>, KmsError> {
        self.list_indexed(SESSION_INDEX).await
    }

    async fn close(&self) -> Result<(), KmsError> {
        // `ConnectionManager` has no explicit close; dropping it closes the
        // underlying connection.
        Ok(())
    }

    async fn health_check(&self) -> Result<(), KmsError> {
        let mut conn = self.manager.clone();
        let exists: bool = conn.exists(SCHEMA_KEY).await.map_err(to_err)?;
        if !exists {
            return Err(KmsError::Persistence(
                "schema version missing".to_string(),
            ));
        }
        Ok(())
    }
}
