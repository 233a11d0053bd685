//! State bucket persistence.
//!
//! The backing store owns the only mutual-exclusion boundary the engine
//! needs: [`StateStore::merge`] runs the read-admit-merge-write sequence
//! for one address as a single atomic unit. A relational backend would map
//! this onto a short transaction; the in-memory store ships for tests and
//! single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::session::{MultiverseId, UniverseId, WorldId};

use super::StateAddress;

/// The granularity owning one bucket. An address lives in exactly one of
/// these for a given session layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketOwner {
    World(WorldId),
    Universe(UniverseId),
    Multiverse(MultiverseId),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no state bucket for {0:?}")]
    MissingBucket(BucketOwner),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result of one atomic merge. `written` is `None` when the closure
/// refused the update (admit gate), in which case nothing was persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeOutcome {
    pub old: Option<f64>,
    pub written: Option<f64>,
}

pub trait StateStore: Send + Sync {
    fn create_bucket(&self, owner: BucketOwner);

    fn drop_bucket(&self, owner: BucketOwner);

    fn read(&self, owner: BucketOwner, address: &StateAddress) -> Result<Option<f64>, StoreError>;

    /// Atomic read-merge-write of one address. The closure receives the
    /// stored value and returns what to persist, or `None` to leave the
    /// bucket untouched.
    fn merge(
        &self,
        owner: BucketOwner,
        address: &StateAddress,
        apply: &mut dyn FnMut(Option<f64>) -> Option<f64>,
    ) -> Result<MergeOutcome, StoreError>;

    fn save_snapshot(
        &self,
        multiverse: MultiverseId,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError>;

    fn load_snapshot(
        &self,
        multiverse: MultiverseId,
        tag: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<BucketOwner, HashMap<StateAddress, f64>>>,
    snapshots: Mutex<HashMap<(MultiverseId, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn create_bucket(&self, owner: BucketOwner) {
        self.buckets
            .lock()
            .unwrap()
            .entry(owner)
            .or_insert_with(HashMap::new);
    }

    fn drop_bucket(&self, owner: BucketOwner) {
        self.buckets.lock().unwrap().remove(&owner);
    }

    fn read(&self, owner: BucketOwner, address: &StateAddress) -> Result<Option<f64>, StoreError> {
        let buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .get(&owner)
            .ok_or(StoreError::MissingBucket(owner))?;
        Ok(bucket.get(address).copied())
    }

    fn merge(
        &self,
        owner: BucketOwner,
        address: &StateAddress,
        apply: &mut dyn FnMut(Option<f64>) -> Option<f64>,
    ) -> Result<MergeOutcome, StoreError> {
        // the bucket map lock is the transaction boundary here
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .get_mut(&owner)
            .ok_or(StoreError::MissingBucket(owner))?;
        let old = bucket.get(address).copied();
        let written = apply(old);
        if let Some(value) = written {
            bucket.insert(address.clone(), value);
        }
        Ok(MergeOutcome { old, written })
    }

    fn save_snapshot(
        &self,
        multiverse: MultiverseId,
        tag: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.snapshots
            .lock()
            .unwrap()
            .insert((multiverse, tag.to_string()), bytes);
        Ok(())
    }

    fn load_snapshot(
        &self,
        multiverse: MultiverseId,
        tag: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&(multiverse, tag.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_against_missing_bucket_fails() {
        let store = MemoryStore::new();
        let address = StateAddress::new("score", "total");
        let result = store.merge(BucketOwner::World(1), &address, &mut |_| Some(1.0));
        assert!(matches!(result, Err(StoreError::MissingBucket(_))));
    }

    #[test]
    fn merge_persists_and_reports_old() {
        let store = MemoryStore::new();
        let owner = BucketOwner::Universe(9);
        let address = StateAddress::new("score", "total");
        store.create_bucket(owner);

        let outcome = store.merge(owner, &address, &mut |_| Some(5.0)).unwrap();
        assert_eq!(outcome, MergeOutcome { old: None, written: Some(5.0) });

        let outcome = store
            .merge(owner, &address, &mut |old| Some(old.unwrap() + 1.0))
            .unwrap();
        assert_eq!(outcome.old, Some(5.0));
        assert_eq!(store.read(owner, &address).unwrap(), Some(6.0));
    }

    #[test]
    fn refused_merge_writes_nothing() {
        let store = MemoryStore::new();
        let owner = BucketOwner::Multiverse(1);
        let address = StateAddress::new("session", "first_finish");
        store.create_bucket(owner);

        let outcome = store.merge(owner, &address, &mut |_| None).unwrap();
        assert_eq!(outcome.written, None);
        assert_eq!(store.read(owner, &address).unwrap(), None);
    }

    #[test]
    fn snapshot_round_trip() {
        let store = MemoryStore::new();
        store.save_snapshot(3, "race", vec![1, 2, 3]).unwrap();
        assert_eq!(store.load_snapshot(3, "race").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.load_snapshot(3, "other").unwrap(), None);
    }
}
