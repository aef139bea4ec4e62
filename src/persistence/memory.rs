//! In-memory `Store`, used for tests and as a reference implementation.
//!
//! Every read and write clones through the lock, the same isolation the
//! corpus's RocksDB-backed node stores get for free by serializing to owned
//! buffers: no caller can mutate a value after handing it to `save` and have
//! that mutation observed by a later `load`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::KmsError;
use crate::model::{Epoch, KeyShareVersion, NodeState, ProtocolSessionState};
use crate::persistence::Store;

#[derive(Default)]
struct Inner {
    key_shares: HashMap<Epoch, KeyShareVersion>,
    active_epoch: Option<Epoch>,
    node_state: Option<NodeState>,
    sessions: HashMap<String, ProtocolSessionState>,
    closed: bool,
}

pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("in-memory store lock poisoned")
    }

    fn lock_mut(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("in-memory store lock poisoned")
    }

    fn check_open(guard: &Inner) -> Result<(), KmsError> {
        if guard.closed {
            return Err(KmsError::Persistence("store is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_key_share(&self, version: &KeyShareVersion) -> Result<(), KmsError> {
        let mut guard = self.lock_mut();
        Self::check_open(&guard)?;
        guard.key_shares.insert(version.epoch, version.clone());
        Ok(())
    }

    async fn load_key_share(&self, epoch: Epoch) -> Result<Option<KeyShareVersion>, KmsError> {
        let guard = self.lock();
        Self::check_open(&guard)?;
        Ok(guard.key_shares.get(&epoch).cloned())
    }

    async fn list_key_shares(&self) -> Result<Vec<KeyShareVersion>, KmsError> {
        let guard = self.lock();
        Self::check_open(&guard)?;
        let mut versions: Vec<KeyShareVersion> = guard.key_shares.values().cloned().collect();
        versions.sort_by_key(|v| v.epoch);
        Ok(versions)
    }

    async fn delete_key_share(&self, epoch: Epoch) -> Result<(), KmsError> {
        let mut guard = self.lock_mut();
        Self::check_open(&guard)?;
        guard.key_shares.remove(&epoch);
        Ok(())
    }

    async fn set_active_epoch(&self, epoch: Epoch) -> Result<(), KmsError> {
        let mut guard = self.lock_mut();
        Self::check_open(&guard)?;
        guard.active_epoch = Some(epoch);
        Ok(())
    }

    async fn get_active_epoch(&self) -> Result<Option<Epoch>, KmsError> {
        let guard = self.lock();
        Self::check_open(&guard)?;
        Ok(guard.active_epoch)
    }

    async fn save_node_state(&self, state: &NodeState) -> Result<(), KmsError> {
        let mut guard = self.lock_mut();
        Self::check_open(&guard)?;
        guard.node_state = Some(state.clone());
        Ok(())
    }

    async fn load_node_state(&self) -> Result<Option<NodeState>, KmsError> {
        let guard = self.lock();
        Self::check_open(&guard)?;
        Ok(guard.node_state.clone())
    }

    async fn save_session(&self, session: &ProtocolSessionState) -> Result<(), KmsError> {
        let mut guard = self.lock_mut();
        Self::check_open(&guard)?;
        guard
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<ProtocolSessionState>, KmsError> {
        let guard = self.lock();
        Self::check_open(&guard)?;
        Ok(guard.sessions.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), KmsError> {
        let mut guard = self.lock_mut();
        Self::check_open(&guard)?;
        guard.sessions.remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<ProtocolSessionState>, KmsError> {
        let guard = self.lock();
        Self::check_open(&guard)?;
        Ok(guard.sessions.values().cloned().collect())
    }

    async fn close(&self) -> Result<(), KmsError> {
        self.lock_mut().closed = true;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), KmsError> {
        if self.lock().closed {
            return Err(KmsError::Persistence("store is closed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::{G2Point, SecretScalar};
    use blstrs::Scalar as Fr;

    fn sample_version(epoch: Epoch) -> KeyShareVersion {
        KeyShareVersion {
            epoch,
            node_id: crate::node_id::NodeId(1),
            private_share: SecretScalar::new(Fr::from(7u64)),
            commitments: vec![G2Point::identity()],
            master_public_key: G2Point::identity(),
            created_at_unix: 0,
            active: false,
        }
    }

    #[tokio::test]
    async fn missing_keys_return_none_not_error() {
        let store = InMemoryStore::new();
        assert!(store.load_key_share(5).await.unwrap().is_none());
        assert!(store.load_node_state().await.unwrap().is_none());
        assert!(store.get_active_epoch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_key_shares_sorted_ascending() {
        let store = InMemoryStore::new();
        store.save_key_share(&sample_version(3)).await.unwrap();
        store.save_key_share(&sample_version(1)).await.unwrap();
        store.save_key_share(&sample_version(2)).await.unwrap();
        let epochs: Vec<Epoch> = store
            .list_key_shares()
            .await
            .unwrap()
            .iter()
            .map(|v| v.epoch)
            .collect();
        assert_eq!(epochs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_store_fails_health_check() {
        let store = InMemoryStore::new();
        store.close().await.unwrap();
        assert!(store.health_check().await.is_err());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_store_rejects_all_data_operations() {
        let store = InMemoryStore::new();
        store.save_key_share(&sample_version(1)).await.unwrap();
        store.close().await.unwrap();

        assert!(store.save_key_share(&sample_version(2)).await.is_err());
        assert!(store.load_key_share(1).await.is_err());
        assert!(store.list_key_shares().await.is_err());
        assert!(store.delete_key_share(1).await.is_err());
        assert!(store.set_active_epoch(1).await.is_err());
        assert!(store.get_active_epoch().await.is_err());
        let node_state = NodeState {
            node_id: crate::node_id::NodeId(1),
            last_observed_epoch: 0,
            last_processed_block: 0,
        };
        assert!(store.save_node_state(&node_state).await.is_err());
        assert!(store.load_node_state().await.is_err());
        assert!(store.list_sessions().await.is_err());
    }
}
