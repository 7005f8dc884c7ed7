//! Filesystem-backed object store.
//!
//! Objects live at `<root>/<key>`. Content types are kept in sidecar files
//! under `<root>/.meta/<key>.type`; the leading dot keeps them out of every
//! valid key space.

use crate::signing::UrlSigner;
use crate::{validate_key, ObjectEntry, ObjectStore, StoreError};
use rand::RngCore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const META_DIR: &str = ".meta";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// An object fetched through a verified signed URL.
#[derive(Debug)]
pub struct SignedObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub struct FsObjectStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl FsObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, signer: UrlSigner) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            key: root.display().to_string(),
            source,
        })?;
        tracing::info!(root = %root.display(), "object store opened");
        Ok(Self { root, signer })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a signed URL request to the object's bytes and content type.
    pub fn open_signed(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<SignedObject, StoreError> {
        validate_key(key)?;
        self.signer.verify(key, expires, signature)?;
        let bytes = self.get(key)?;
        let content_type = std::fs::read_to_string(self.meta_path(key))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.to_string());
        Ok(SignedObject {
            bytes,
            content_type,
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.type"))
    }
}

/// Write `bytes` to `path` through a hidden temp file in the same directory
/// and rename it into place, so readers never observe a partial object.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{:016x}.tmp", rand::thread_rng().next_u64()));

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };

        write_atomic(&path, bytes).map_err(io_err)?;
        write_atomic(&self.meta_path(key), content_type.as_bytes()).map_err(io_err)?;

        tracing::debug!(key, bytes = bytes.len(), content_type, "object stored");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(key)?;
        std::fs::read(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
            _ => StoreError::Io {
                key: key.to_string(),
                source,
            },
        })
    }

    /// Lists regular files directly under `prefix`, sorted by name.
    /// A prefix that does not exist yet lists as empty.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let dir = self.object_path(prefix.trim_end_matches('/'))?;
        let io_err = |source| StoreError::Io {
            key: prefix.to_string(),
            source,
        };

        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().map_err(io_err)?;
            if meta.is_file() {
                entries.push(ObjectEntry {
                    name,
                    size: meta.len(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn sign(&self, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        self.signer.sign(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let signer = UrlSigner::new(b"secret".to_vec(), "http://files.test", 60);
        let store = FsObjectStore::open(dir.path().join("objects"), signer).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        store.put("face_detection/1/embedding.npy", b"blob", "application/octet-stream").unwrap();
        assert_eq!(store.get("face_detection/1/embedding.npy").unwrap(), b"blob");
    }

    #[test]
    fn test_put_overwrites() {
        let (_dir, store) = store();
        store.put("u/embedding.npy", b"first", "application/octet-stream").unwrap();
        store.put("u/embedding.npy", b"second", "application/octet-stream").unwrap();
        assert_eq!(store.get("u/embedding.npy").unwrap(), b"second");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store.get("face_detection/1/embedding.npy").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, store) = store();
        assert!(matches!(
            store.put("../escape", b"x", "text/plain"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.get("a/../../b"), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_list_direct_children_sorted() {
        let (_dir, store) = store();
        store.put("face_detection/1/baseline_20_2.jpg", b"b", "image/jpeg").unwrap();
        store.put("face_detection/1/baseline_10_1.jpg", b"aa", "image/jpeg").unwrap();
        store.put("face_detection/1/embedding.npy", b"e", "application/octet-stream").unwrap();
        store.put("face_detection/1/nested/deep.jpg", b"d", "image/jpeg").unwrap();
        store.put("face_detection/2/baseline_1_1.jpg", b"x", "image/jpeg").unwrap();

        let names: Vec<String> = store
            .list("face_detection/1")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(
            names,
            vec!["baseline_10_1.jpg", "baseline_20_2.jpg", "embedding.npy"]
        );
    }

    #[test]
    fn test_list_missing_prefix_is_empty() {
        let (_dir, store) = store();
        assert!(store.list("face_detection/nobody").unwrap().is_empty());
    }

    #[test]
    fn test_list_reports_size() {
        let (_dir, store) = store();
        store.put("p/a.bin", b"12345", "application/octet-stream").unwrap();
        let entries = store.list("p/").unwrap();
        assert_eq!(entries, vec![ObjectEntry { name: "a.bin".into(), size: 5 }]);
    }

    #[test]
    fn test_open_signed_returns_content_type() {
        let (_dir, store) = store();
        store.put("u/baseline_1_1.jpg", b"jpeg-bytes", "image/jpeg").unwrap();
        let url = store.sign("u/baseline_1_1.jpg").unwrap();

        let query = url.split_once('?').unwrap().1;
        let mut expires = 0i64;
        let mut signature = "";
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            if k == "expires" {
                expires = v.parse().unwrap();
            } else if k == "signature" {
                signature = v;
            }
        }

        let obj = store.open_signed("u/baseline_1_1.jpg", expires, signature).unwrap();
        assert_eq!(obj.bytes, b"jpeg-bytes");
        assert_eq!(obj.content_type, "image/jpeg");
    }

    #[test]
    fn test_open_signed_rejects_bad_signature() {
        let (_dir, store) = store();
        store.put("u/a.jpg", b"x", "image/jpeg").unwrap();
        let far_future = chrono::Utc::now().timestamp() + 3600;
        assert!(matches!(
            store.open_signed("u/a.jpg", far_future, "deadbeef"),
            Err(StoreError::InvalidSignature)
        ));
    }
}
