use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use crate::core::config::StorageConfig;
use crate::core::error::StorageError;

use super::filesystem::FilesystemObjectStore;
use super::memory::InMemoryObjectStore;
#[cfg(feature = "s3")]
use super::s3::S3ObjectStore;
use super::{GetObjectOutput, ObjectStore};

/// Sub-namespace holding resized variants, relative to the originals.
pub const VARIANTS_NAMESPACE: &str = "cache";

/// Object store chosen at startup from `storage.backend`.
///
/// `ObjectStore` uses return-position `impl Future`, so it is not object
/// safe; runtime selection goes through this enum instead of `dyn`.
pub enum ObjectBackend {
    Memory(InMemoryObjectStore),
    Filesystem(FilesystemObjectStore),
    #[cfg(feature = "s3")]
    S3(S3ObjectStore),
}

impl ObjectBackend {
    /// Build the canonical and variants stores for `config`.
    pub async fn from_config(config: &StorageConfig) -> Result<(Self, Self), StorageError> {
        match config.backend.as_str() {
            "memory" => Ok((
                Self::Memory(InMemoryObjectStore::new("canonical")),
                Self::Memory(InMemoryObjectStore::new("variants")),
            )),
            "filesystem" => {
                let root = Path::new(&config.local_path);
                Ok((
                    Self::Filesystem(FilesystemObjectStore::new("canonical", root).await?),
                    Self::Filesystem(
                        FilesystemObjectStore::new("variants", root.join(VARIANTS_NAMESPACE))
                            .await?,
                    ),
                ))
            }
            #[cfg(feature = "s3")]
            "s3" => Ok((
                Self::S3(S3ObjectStore::new("canonical", config, "")),
                Self::S3(S3ObjectStore::new(
                    "variants",
                    config,
                    &format!("{}/", VARIANTS_NAMESPACE),
                )),
            )),
            other => Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("storage backend '{}' is not available in this build", other),
            ))),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $body:expr) => {
        match $self {
            ObjectBackend::Memory($store) => $body,
            ObjectBackend::Filesystem($store) => $body,
            #[cfg(feature = "s3")]
            ObjectBackend::S3($store) => $body,
        }
    };
}

impl ObjectStore for ObjectBackend {
    fn label(&self) -> &str {
        dispatch!(self, s => s.label())
    }

    fn id_from_name(&self, name: &str) -> String {
        dispatch!(self, s => s.id_from_name(name))
    }

    async fn put(
        &self,
        name: &str,
        data: Bytes,
        mime: &str,
        headers: HeaderMap,
    ) -> Result<String, StorageError> {
        dispatch!(self, s => s.put(name, data, mime, headers).await)
    }

    async fn get_reader(&self, id: &str) -> Result<GetObjectOutput, StorageError> {
        dispatch!(self, s => s.get_reader(id).await)
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<String, StorageError> {
        dispatch!(self, s => s.copy(dst, src).await)
    }

    async fn expiring_url(&self, id: &str, ttl: Duration) -> Result<String, StorageError> {
        dispatch!(self, s => s.expiring_url(id, ttl).await)
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        dispatch!(self, s => s.delete(id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;

    #[tokio::test]
    async fn test_memory_backend_pair() {
        let mut config = AppConfig::default().storage;
        config.backend = "memory".to_string();
        let (canonical, variants) = ObjectBackend::from_config(&config).await.unwrap();
        assert_ne!(canonical.id_from_name("abc"), variants.id_from_name("abc"));

        let id = canonical
            .put("abc", Bytes::from("x"), "text/plain", HeaderMap::new())
            .await
            .unwrap();
        assert!(canonical.get_reader(&id).await.is_ok());
        assert!(variants.get_reader(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_filesystem_backend_uses_cache_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default().storage;
        config.backend = "filesystem".to_string();
        config.local_path = dir.path().to_string_lossy().to_string();

        let (_canonical, variants) = ObjectBackend::from_config(&config).await.unwrap();
        variants
            .put("abc-1x1-up_false-crop_false", Bytes::from("v"), "image/jpeg", HeaderMap::new())
            .await
            .unwrap();
        assert!(dir.path().join("cache").join("abc-1x1-up_false-crop_false").exists());
    }

    #[tokio::test]
    async fn test_unknown_backend_fails() {
        let mut config = AppConfig::default().storage;
        config.backend = "tape".to_string();
        assert!(ObjectBackend::from_config(&config).await.is_err());
    }
}
