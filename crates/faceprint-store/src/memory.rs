//! In-process object store.

use crate::{validate_key, ObjectEntry, ObjectStore, StoreError};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// Map-backed store. Listing is lexical by key; signed URLs use the
/// `memory://` scheme and are not resolvable outside the process.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All stored keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock().get(key).map(|o| o.content_type.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.lock().insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.lock()
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let dir = prefix.trim_end_matches('/');
        validate_key(dir)?;
        let dir = format!("{dir}/");

        Ok(self
            .lock()
            .range(dir.clone()..)
            .take_while(|(key, _)| key.starts_with(&dir))
            .filter_map(|(key, obj)| {
                let name = &key[dir.len()..];
                (!name.contains('/')).then(|| ObjectEntry {
                    name: name.to_string(),
                    size: obj.bytes.len() as u64,
                })
            })
            .collect())
    }

    fn sign(&self, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        Ok(format!("memory://{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_roundtrip() {
        let store = MemoryObjectStore::new();
        store.put("a/b.jpg", b"img", "image/jpeg").unwrap();
        assert_eq!(store.get("a/b.jpg").unwrap(), b"img");
        assert_eq!(store.content_type("a/b.jpg").as_deref(), Some("image/jpeg"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_missing() {
        let store = MemoryObjectStore::new();
        assert!(store.get("a/b.jpg").unwrap_err().is_not_found());
    }

    #[test]
    fn test_memory_list_scoped_to_prefix() {
        let store = MemoryObjectStore::new();
        store.put("face_detection/1/baseline_1_1.jpg", b"x", "image/jpeg").unwrap();
        store.put("face_detection/1/embedding.npy", b"yy", "application/octet-stream").unwrap();
        store.put("face_detection/1/sub/z.jpg", b"z", "image/jpeg").unwrap();
        store.put("face_detection/10/baseline_1_1.jpg", b"w", "image/jpeg").unwrap();

        let entries = store.list("face_detection/1").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["baseline_1_1.jpg", "embedding.npy"]);
        assert_eq!(entries[1].size, 2);
    }

    #[test]
    fn test_memory_sign() {
        let store = MemoryObjectStore::new();
        assert_eq!(store.sign("a/b.jpg").unwrap(), "memory://a/b.jpg");
        assert!(store.sign("../b").is_err());
    }
}
