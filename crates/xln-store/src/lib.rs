//! The `KvStore` capability: the only owner of durable state.
//!
//! The core never mutates storage directly; the runtime writes snapshots,
//! input logs and profile records at tick boundaries through this trait.
//! Two implementations ship: [`MemStore`] for tests and deterministic
//! replay, and [`SledStore`] over sled (pure-Rust embedded DB).
//!
//! Persisted layout (one namespace per runtime):
//!   snapshot/<height>     — serialized Env at that height
//!   inputs/<height>       — the RuntimeInput applied to produce it
//!   profile/<entity_id>   — public profile record (serde_json)
//!   j-cursor              — last processed J-block number

use std::collections::BTreeMap;
use std::path::Path;

use xln_core::types::{EntityId, Height};
use xln_core::XlnError;

// ── Key layout ───────────────────────────────────────────────────────────────

pub mod keys {
    use super::*;

    pub const J_CURSOR: &[u8] = b"j-cursor";

    /// `snapshot/<height>` with a big-endian height so prefix scans return
    /// ascending order.
    pub fn snapshot(height: Height) -> Vec<u8> {
        let mut k = b"snapshot/".to_vec();
        k.extend_from_slice(&height.to_be_bytes());
        k
    }

    pub fn inputs(height: Height) -> Vec<u8> {
        let mut k = b"inputs/".to_vec();
        k.extend_from_slice(&height.to_be_bytes());
        k
    }

    pub fn profile(entity_id: &EntityId) -> Vec<u8> {
        let mut k = b"profile/".to_vec();
        k.extend_from_slice(entity_id.as_bytes());
        k
    }
}

// ── Trait ────────────────────────────────────────────────────────────────────

/// Minimal durable key/value capability. Writes within one tick are applied
/// together; the runtime never writes mid-tick.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, XlnError>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), XlnError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), XlnError>;
    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, XlnError>;
}

// ── MemStore ─────────────────────────────────────────────────────────────────

/// BTreeMap-backed store for tests; iteration order matches the sled store.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, XlnError> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), XlnError> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), XlnError> {
        self.map.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, XlnError> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ── SledStore ────────────────────────────────────────────────────────────────

/// Durable store backed by sled.
pub struct SledStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    /// Open or create the store at `path` under the given namespace.
    pub fn open<P: AsRef<Path>>(path: P, namespace: &str) -> Result<Self, XlnError> {
        let db = sled::open(path).map_err(|e| XlnError::Storage(e.to_string()))?;
        let tree = db
            .open_tree(namespace)
            .map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(Self { _db: db, tree })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), XlnError> {
        self.tree
            .flush()
            .map(|_| ())
            .map_err(|e| XlnError::Storage(e.to_string()))
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, XlnError> {
        Ok(self
            .tree
            .get(key)
            .map_err(|e| XlnError::Storage(e.to_string()))?
            .map(|ivec| ivec.to_vec()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), XlnError> {
        self.tree
            .insert(key, value)
            .map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), XlnError> {
        self.tree
            .remove(key)
            .map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, XlnError> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| XlnError::Storage(e.to_string()))?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &mut dyn KvStore) {
        store.put(&keys::snapshot(1), b"s1").unwrap();
        store.put(&keys::snapshot(2), b"s2").unwrap();
        store.put(&keys::inputs(1), b"i1").unwrap();
        store.put(keys::J_CURSOR, &42u64.to_be_bytes()).unwrap();

        assert_eq!(store.get(&keys::snapshot(1)).unwrap().unwrap(), b"s1");
        assert!(store.get(&keys::snapshot(9)).unwrap().is_none());

        let snaps = store.scan_prefix(b"snapshot/").unwrap();
        assert_eq!(snaps.len(), 2);
        // Big-endian heights scan in ascending order.
        assert_eq!(snaps[0].1, b"s1");
        assert_eq!(snaps[1].1, b"s2");

        store.delete(&keys::snapshot(1)).unwrap();
        assert!(store.get(&keys::snapshot(1)).unwrap().is_none());
    }

    #[test]
    fn mem_store_round_trip() {
        let mut store = MemStore::new();
        exercise(&mut store);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn sled_store_round_trip() {
        let dir = std::env::temp_dir().join("xln_store_test");
        let _ = std::fs::remove_dir_all(&dir);
        let mut store = SledStore::open(&dir, "test").unwrap();
        exercise(&mut store);
        store.flush().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn profile_keys_differ_per_entity() {
        let a = EntityId::from_bytes([1u8; 32]);
        let b = EntityId::from_bytes([2u8; 32]);
        assert_ne!(keys::profile(&a), keys::profile(&b));
        assert!(keys::profile(&a).starts_with(b"profile/"));
    }
}
