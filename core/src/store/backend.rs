// Storage abstraction for persistence
//
// Keys are compared bytewise and scans return entries in ascending key order
// on every backend, so big-endian encoded ids iterate oldest-first.

use anyhow::Context;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Unified storage trait for ordered key/value persistence
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn remove(&self, key: &[u8]) -> Result<(), String>;
    /// All entries under `prefix`, ascending by key
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String>;
    fn flush(&self) -> Result<(), String>;
}

/// In-memory storage used by tests and when persistence is unavailable
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: &str) -> std::result::Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.db.insert(key, value).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.db.remove(key).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| e.to_string())?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String> {
        Ok(self.db.scan_prefix(prefix).count())
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Open the sled database under `storage_path`, creating the directory
pub fn open_persistent(storage_path: &str) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let base = Path::new(storage_path);
    std::fs::create_dir_all(base)
        .with_context(|| format!("Failed to create storage directory {}", storage_path))?;
    let db_path = base.join("geotrack.db");
    let storage = SledStorage::new(db_path.to_string_lossy().as_ref())
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Failed to open sled database at {}", db_path.display()))?;
    Ok(Arc::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &dyn StorageBackend) {
        storage.put(b"loc_\x00\x02", b"two").unwrap();
        storage.put(b"loc_\x00\x01", b"one").unwrap();
        storage.put(b"log_\x00\x01", b"other").unwrap();

        let scanned = storage.scan_prefix(b"loc_").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].1, b"one".to_vec());
        assert_eq!(scanned[1].1, b"two".to_vec());
        assert_eq!(storage.count_prefix(b"loc_").unwrap(), 2);

        storage.remove(b"loc_\x00\x01").unwrap();
        assert_eq!(storage.get(b"loc_\x00\x01").unwrap(), None);
        assert_eq!(storage.count_prefix(b"loc_").unwrap(), 1);
        storage.flush().unwrap();
    }

    #[test]
    fn test_memory_storage_ordered_scan() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_sled_storage_ordered_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").to_str().unwrap().to_string();
        exercise(&SledStorage::new(&path).unwrap());
    }

    #[test]
    fn test_open_persistent_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store");
        let storage = open_persistent(path.to_str().unwrap()).unwrap();
        storage.put(b"k", b"v").unwrap();
        assert!(path.join("geotrack.db").exists());
    }
}
