//! Thread-safe, in-process index of `KeyShareVersion`s (§4.10).

use std::sync::RwLock;

use crate::error::KmsError;
use crate::model::{Epoch, KeyShareVersion};

struct Inner {
    versions: Vec<KeyShareVersion>,
    active_index: Option<usize>,
    pending: Option<KeyShareVersion>,
}

/// Holds every known key share version plus, at most, one pending (not yet
/// activated) version produced by an in-progress reshare.
///
/// A single `RwLock` guards all mutation, per the concurrency model: writers
/// exclusive, readers shared, and `activate_pending` performs its four-step
/// promotion under one lock acquisition so no reader observes an
/// intermediate state with two active versions or zero.
pub struct KeyStore {
    inner: RwLock<Inner>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                versions: Vec::new(),
                active_index: None,
                pending: None,
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("key store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("key store lock poisoned")
    }

    /// Adds `version` to the known set without changing which version is
    /// active.
    pub fn add_version(&self, version: KeyShareVersion) {
        self.write().versions.push(version);
    }

    /// Marks the version at `epoch` as the active one, deactivating any
    /// other. Errors if no such version is known.
    pub fn set_active(&self, epoch: Epoch) -> Result<(), KmsError> {
        let mut guard = self.write();
        let index = guard
            .versions
            .iter()
            .position(|v| v.epoch == epoch)
            .ok_or(KmsError::Conflict(format!(
                "no key share version for epoch {epoch}"
            )))?;
        for v in &mut guard.versions {
            v.active = false;
        }
        guard.versions[index].active = true;
        guard.active_index = Some(index);
        Ok(())
    }

    pub fn get_active_epoch(&self) -> Option<Epoch> {
        let guard = self.read();
        guard.active_index.map(|i| guard.versions[i].epoch)
    }

    pub fn get_active_private_share(&self) -> Option<crate::bls::SecretScalar> {
        let guard = self.read();
        guard
            .active_index
            .map(|i| guard.versions[i].private_share.duplicate())
    }

    pub fn get_active_commitments(&self) -> Option<Vec<crate::bls::G2Point>> {
        let guard = self.read();
        guard
            .active_index
            .map(|i| guard.versions[i].commitments.clone())
    }

    /// Stages `version` as the pending version, replacing any prior pending
    /// version.
    pub fn set_pending(&self, version: KeyShareVersion) {
        self.write().pending = Some(version);
    }

    pub fn get_pending_epoch(&self) -> Option<Epoch> {
        self.read().pending.as_ref().map(|v| v.epoch)
    }

    pub fn clear_pending(&self) {
        self.write().pending = None;
    }

    /// Promotes the pending version to active: marks the prior active
    /// inactive, marks the pending active, moves it into the version list,
    /// and clears the pending slot, all under one write-lock acquisition.
    pub fn activate_pending(&self) -> Result<Epoch, KmsError> {
        let mut guard = self.write();
        let mut pending = guard
            .pending
            .take()
            .ok_or_else(|| KmsError::Conflict("no pending key share version to activate".to_string()))?;
        for v in &mut guard.versions {
            v.active = false;
        }
        pending.active = true;
        let epoch = pending.epoch;
        guard.versions.push(pending);
        guard.active_index = Some(guard.versions.len() - 1);
        Ok(epoch)
    }

    /// The version active at `timestamp`, computed as the newest version
    /// whose `[created_at_unix, created_at_unix + epoch_length)` window
    /// contains `timestamp`. Used to answer "what key signed this,
    /// historically" queries spanning an epoch boundary; `epoch_length` is
    /// the node's configured epoch duration in seconds, so a timestamp that
    /// falls after a version's window has closed (no successor was ever
    /// activated) correctly yields `None` rather than stale-matching it.
    pub fn get_version_at_time(&self, timestamp: i64, epoch_length: i64) -> Option<Epoch> {
        self.read()
            .versions
            .iter()
            .filter(|v| {
                v.created_at_unix <= timestamp && timestamp < v.created_at_unix + epoch_length
            })
            .max_by_key(|v| v.created_at_unix)
            .map(|v| v.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::{G2Point, SecretScalar};
    use crate::node_id::NodeId;
    use blstrs::Scalar as Fr;

    fn version(epoch: Epoch, created_at: i64) -> KeyShareVersion {
        KeyShareVersion {
            epoch,
            node_id: NodeId(1),
            private_share: SecretScalar::new(Fr::from(epoch.unsigned_abs())),
            commitments: vec![G2Point::identity()],
            master_public_key: G2Point::identity(),
            created_at_unix: created_at,
            active: false,
        }
    }

    #[test]
    fn activate_pending_swaps_atomically() {
        let store = KeyStore::new();
        store.add_version(version(0, 0));
        store.set_active(0).unwrap();
        assert_eq!(store.get_active_epoch(), Some(0));

        store.set_pending(version(1, 100));
        assert_eq!(store.get_pending_epoch(), Some(1));

        let activated = store.activate_pending().unwrap();
        assert_eq!(activated, 1);
        assert_eq!(store.get_active_epoch(), Some(1));
        assert_eq!(store.get_pending_epoch(), None);
    }

    #[test]
    fn activate_pending_without_pending_errors() {
        let store = KeyStore::new();
        assert!(store.activate_pending().is_err());
    }

    #[test]
    fn set_active_rejects_unknown_epoch() {
        let store = KeyStore::new();
        store.add_version(version(0, 0));
        assert!(store.set_active(5).is_err());
    }

    #[test]
    fn version_at_time_picks_newest_within_window() {
        let store = KeyStore::new();
        store.add_version(version(0, 0));
        store.add_version(version(1, 100));
        store.add_version(version(2, 200));

        assert_eq!(store.get_version_at_time(50, 100), Some(0));
        assert_eq!(store.get_version_at_time(150, 100), Some(1));
        assert_eq!(store.get_version_at_time(250, 100), Some(2));
        assert_eq!(store.get_version_at_time(-10, 100), None);
    }

    #[test]
    fn version_at_time_beyond_window_with_no_successor_is_none() {
        let store = KeyStore::new();
        store.add_version(version(0, 0));
        store.add_version(version(1, 100));

        // Epoch 1's window is [100, 200); nothing covers t=250, even though
        // epoch 1 is the newest version created at or before t=250.
        assert_eq!(store.get_version_at_time(250, 100), None);
    }
}
