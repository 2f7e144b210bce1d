use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::core::error::StorageError;

use super::{timed_get, timed_put, validate_name, with_content_headers, GetObjectOutput, ObjectStore};

const SCHEME: &str = "file://";
const SIDECAR_SUFFIX: &str = ".meta.json";

// ---------------------------------------------------------------------------
// FilesystemObjectStore
// ---------------------------------------------------------------------------

/// Object store backed by a local directory.
///
/// Each object is a plain file under `root` with its header map in a JSON
/// sidecar next to it. Writes go to a temporary file first and are renamed
/// into place, so readers never observe a partial object.
pub struct FilesystemObjectStore {
    label: String,
    root: PathBuf,
}

impl FilesystemObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn new(label: &str, root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            label: label.to_string(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a canonical id back to a path inside this store.
    fn path_for_id(&self, id: &str) -> Result<PathBuf, StorageError> {
        let invalid = || StorageError::GetFailed {
            id: id.to_string(),
            reason: "id does not belong to this store".to_string(),
        };
        let path = id.strip_prefix(SCHEME).ok_or_else(invalid)?;
        let name = Path::new(path)
            .strip_prefix(&self.root)
            .map_err(|_| invalid())?
            .to_str()
            .ok_or_else(invalid)?;
        validate_name(name).map_err(|_| invalid())?;
        Ok(self.root.join(name))
    }

    fn sidecar(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn encode_headers(headers: &HeaderMap) -> Result<Vec<u8>, serde_json::Error> {
    let map: BTreeMap<&str, &str> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
        .collect();
    serde_json::to_vec(&map)
}

fn decode_headers(raw: &[u8]) -> Result<HeaderMap, serde_json::Error> {
    let map: BTreeMap<String, String> = serde_json::from_slice(raw)?;
    let mut headers = HeaderMap::new();
    for (k, v) in map {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(&v),
        ) {
            headers.insert(name, value);
        }
    }
    Ok(headers)
}

fn map_io(id: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound { id: id.to_string() }
    } else {
        StorageError::GetFailed {
            id: id.to_string(),
            reason: e.to_string(),
        }
    }
}

impl ObjectStore for FilesystemObjectStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn id_from_name(&self, name: &str) -> String {
        format!("{}{}", SCHEME, self.root.join(name).display())
    }

    async fn put(
        &self,
        name: &str,
        data: Bytes,
        mime: &str,
        headers: HeaderMap,
    ) -> Result<String, StorageError> {
        timed_put(&self.label, async {
            validate_name(name)?;
            let path = self.root.join(name);
            let headers = with_content_headers(headers, mime, data.len());
            let encoded = encode_headers(&headers).map_err(|e| StorageError::PutFailed {
                id: name.to_string(),
                reason: format!("failed to encode headers: {}", e),
            })?;

            // Sidecar first: an object is only visible once its data file exists.
            Self::write_atomic(&Self::sidecar(&path), &encoded).await?;
            Self::write_atomic(&path, &data).await?;
            debug!(store = %self.label, name, size = data.len(), "object written");
            Ok(self.id_from_name(name))
        })
        .await
    }

    async fn get_reader(&self, id: &str) -> Result<GetObjectOutput, StorageError> {
        timed_get(&self.label, async {
            let path = self.path_for_id(id)?;
            let body = tokio::fs::read(&path).await.map_err(|e| map_io(id, e))?;
            let headers = match tokio::fs::read(Self::sidecar(&path)).await {
                Ok(raw) => decode_headers(&raw).map_err(|e| StorageError::GetFailed {
                    id: id.to_string(),
                    reason: format!("corrupt header sidecar: {}", e),
                })?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => HeaderMap::new(),
                Err(e) => return Err(map_io(id, e)),
            };
            Ok(GetObjectOutput {
                body: Bytes::from(body),
                headers,
            })
        })
        .await
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<String, StorageError> {
        let src_path = self.path_for_id(src)?;
        let dst_path = self.path_for_id(dst)?;
        let data = tokio::fs::read(&src_path).await.map_err(|e| map_io(src, e))?;
        if let Ok(sidecar) = tokio::fs::read(Self::sidecar(&src_path)).await {
            Self::write_atomic(&Self::sidecar(&dst_path), &sidecar).await?;
        }
        Self::write_atomic(&dst_path, &data)
            .await
            .map_err(|e| StorageError::CopyFailed {
                dst: dst.to_string(),
                src: src.to_string(),
                reason: e.to_string(),
            })?;
        Ok(dst.to_string())
    }

    /// Local files cannot carry an authenticated expiry; the file URL itself
    /// is returned once the object is known to exist.
    async fn expiring_url(&self, id: &str, _ttl: Duration) -> Result<String, StorageError> {
        let path = self.path_for_id(id)?;
        tokio::fs::metadata(&path).await.map_err(|e| map_io(id, e))?;
        Ok(id.to_string())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let path = self.path_for_id(id)?;
        for p in [Self::sidecar(&path), path] {
            match tokio::fs::remove_file(&p).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::image_headers;

    #[tokio::test]
    async fn test_put_and_get_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new("canonical", dir.path()).await.unwrap();

        let id = store
            .put("abc", Bytes::from("pixels"), "image/png", image_headers(3, 2, Some("abc")))
            .await
            .unwrap();
        assert_eq!(id, store.id_from_name("abc"));
        assert!(dir.path().join("abc").exists());

        let output = store.get_reader(&id).await.unwrap();
        assert_eq!(output.body, Bytes::from("pixels"));
        let meta = output.image_meta();
        assert_eq!(meta.mime_type, "image/png");
        assert_eq!((meta.width, meta.height, meta.size), (3, 2, 6));
        assert_eq!(meta.name.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new("canonical", dir.path()).await.unwrap();
        let err = store
            .get_reader(&store.id_from_name("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_foreign_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new("canonical", dir.path()).await.unwrap();
        assert!(store.get_reader("file:///etc/passwd").await.is_err());
        assert!(store.get_reader("memory://canonical/abc").await.is_err());
        assert!(store.put("../escape", Bytes::from("x"), "text/plain", HeaderMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_variants_subdirectory_is_separate() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = FilesystemObjectStore::new("canonical", dir.path()).await.unwrap();
        let variants = FilesystemObjectStore::new("variants", dir.path().join("cache"))
            .await
            .unwrap();

        let id = variants
            .put("abc-10x10-up_false-crop_false", Bytes::from("v"), "image/jpeg", HeaderMap::new())
            .await
            .unwrap();
        assert!(canonical.get_reader(&id).await.is_err());
        assert!(variants.get_reader(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new("canonical", dir.path()).await.unwrap();
        let src = store
            .put("src", Bytes::from("data"), "image/gif", image_headers(1, 1, None))
            .await
            .unwrap();
        let dst = store.id_from_name("dst");

        store.copy(&dst, &src).await.unwrap();
        let copied = store.get_reader(&dst).await.unwrap();
        assert_eq!(copied.body, Bytes::from("data"));
        assert_eq!(copied.image_meta().mime_type, "image/gif");

        store.delete(&src).await.unwrap();
        assert!(store.get_reader(&src).await.unwrap_err().is_not_found());
        store.delete(&src).await.unwrap();
    }
}
