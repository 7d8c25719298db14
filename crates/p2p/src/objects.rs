//! The shared object store.
//!
//! A convergent grow-and-expire set: insertion of a vector is idempotent
//! and the manager sweeps expired entries. One mutex guards the map;
//! readers that iterate take a snapshot first.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use minode_types::{Object, Vector};

use crate::error::Error;

#[derive(Debug, Default)]
pub struct Objects {
    inner: Mutex<HashMap<Vector, Object>>,
}

#[derive(Serialize, Deserialize)]
struct ObjectsSnapshot {
    version: u32,
    objects: Vec<Object>,
}

impl Objects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("object store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, vector: &Vector) -> bool {
        self.inner
            .lock()
            .expect("object store lock poisoned")
            .contains_key(vector)
    }

    pub fn get(&self, vector: &Vector) -> Option<Object> {
        self.inner
            .lock()
            .expect("object store lock poisoned")
            .get(vector)
            .cloned()
    }

    /// Fetch several objects under a single lock acquisition.
    pub fn get_many<'a>(&self, vectors: impl IntoIterator<Item = &'a Vector>) -> Vec<Object> {
        let inner = self.inner.lock().expect("object store lock poisoned");
        vectors
            .into_iter()
            .filter_map(|vector| inner.get(vector).cloned())
            .collect()
    }

    /// Insert an object the caller has already validated. Returns whether
    /// the vector was new.
    pub fn insert(&self, object: Object) -> bool {
        let mut inner = self.inner.lock().expect("object store lock poisoned");
        match inner.entry(object.vector()) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(object);
                true
            }
            std::collections::hash_map::Entry::Occupied(_) => false,
        }
    }

    /// Drop vectors we already have from `wanted`.
    pub fn retain_missing(&self, wanted: &mut HashSet<Vector>) {
        let inner = self.inner.lock().expect("object store lock poisoned");
        wanted.retain(|vector| !inner.contains_key(vector));
    }

    pub fn remove(&self, vector: &Vector) -> Option<Object> {
        self.inner
            .lock()
            .expect("object store lock poisoned")
            .remove(vector)
    }

    /// Vectors of the objects matching a predicate.
    pub fn keys_where(&self, predicate: impl Fn(&Object) -> bool) -> Vec<Vector> {
        self.inner
            .lock()
            .expect("object store lock poisoned")
            .iter()
            .filter(|(_, object)| predicate(object))
            .map(|(vector, _)| *vector)
            .collect()
    }

    /// Vectors of every object that has not yet reached its end of life.
    pub fn unexpired_vectors(&self, now: u64) -> Vec<Vector> {
        self.keys_where(|object| object.expires_time() > now)
    }

    /// Delete expired objects, returning their vectors.
    pub fn remove_expired(&self, now: u64) -> Vec<Vector> {
        let mut inner = self.inner.lock().expect("object store lock poisoned");
        let expired: Vec<Vector> = inner
            .iter()
            .filter(|(_, object)| object.is_expired(now))
            .map(|(vector, _)| *vector)
            .collect();
        for vector in &expired {
            inner.remove(vector);
            debug!(target: "p2p", "Deleted expired object: {}", vector);
        }
        expired
    }

    /// Copy of the whole store, for iteration outside the lock.
    pub fn snapshot(&self) -> HashMap<Vector, Object> {
        self.inner
            .lock()
            .expect("object store lock poisoned")
            .clone()
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), Error> {
        let snapshot = ObjectsSnapshot {
            version: 1,
            objects: self
                .inner
                .lock()
                .expect("object store lock poisoned")
                .values()
                .cloned()
                .collect(),
        };
        let file = std::fs::File::create(data_dir.join("objects.cbor"))
            .map_err(|e| Error::Persist(e.to_string()))?;
        ciborium::into_writer(&snapshot, file).map_err(|e| Error::Persist(e.to_string()))?;
        debug!(target: "p2p", "Saved objects");
        Ok(())
    }

    pub fn load(&self, data_dir: &Path) {
        let path = data_dir.join("objects.cbor");
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => return,
        };
        match ciborium::from_reader::<ObjectsSnapshot, _>(file) {
            Ok(snapshot) => {
                let mut inner = self.inner.lock().expect("object store lock poisoned");
                for object in snapshot.objects {
                    inner.insert(object.vector(), object);
                }
            }
            Err(err) => {
                warn!(target: "p2p", "Error while loading objects from {:?}: {}", path, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn object(expires_time: u64, payload: &[u8]) -> Object {
        Object::new([0; 8], expires_time, 42, 1, 1, payload.to_vec())
    }

    #[test]
    fn insertion_is_idempotent() {
        let store = Objects::new();
        let obj = object(NOW + 100, b"one");
        assert!(store.insert(obj.clone()));
        assert!(!store.insert(obj.clone()));
        assert_eq!(store.len(), 1);
        assert!(store.has(&obj.vector()));
    }

    #[test]
    fn expiry_sweep_removes_stale_objects() {
        let store = Objects::new();
        let fresh = object(NOW + 100, b"fresh");
        let stale = object(NOW - 4 * 3600, b"stale");
        store.insert(fresh.clone());
        store.insert(stale.clone());

        let removed = store.remove_expired(NOW);
        assert_eq!(removed, vec![stale.vector()]);
        assert!(store.has(&fresh.vector()));
        assert!(!store.has(&stale.vector()));
    }

    #[test]
    fn unexpired_vectors_excludes_past_end_of_life() {
        let store = Objects::new();
        // Past its end of life but within the relay grace period: kept in
        // the store, but never advertised.
        let graceful = object(NOW - 3600, b"graceful");
        let live = object(NOW + 3600, b"live");
        store.insert(graceful.clone());
        store.insert(live.clone());

        assert_eq!(store.unexpired_vectors(NOW), vec![live.vector()]);
        assert!(!store.remove_expired(NOW).contains(&graceful.vector()));
    }

    #[test]
    fn retain_missing_strips_stored_vectors() {
        let store = Objects::new();
        let stored = object(NOW + 100, b"stored");
        store.insert(stored.clone());

        let other = object(NOW + 100, b"other");
        let mut wanted: HashSet<Vector> =
            [stored.vector(), other.vector()].into_iter().collect();
        store.retain_missing(&mut wanted);
        assert_eq!(wanted.into_iter().collect::<Vec<_>>(), vec![other.vector()]);
    }

    #[test]
    fn snapshots_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("minode-objects-{}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();

        let store = Objects::new();
        let obj = object(NOW + 100, b"persisted");
        store.insert(obj.clone());
        store.save(&dir).unwrap();

        let restored = Objects::new();
        restored.load(&dir);
        assert_eq!(restored.get(&obj.vector()), Some(obj));

        std::fs::remove_dir_all(&dir).ok();
    }
}
