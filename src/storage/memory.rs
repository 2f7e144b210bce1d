use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::HeaderMap;
use tokio::sync::RwLock;

use crate::core::error::StorageError;

use super::{timed_get, timed_put, validate_name, with_content_headers, GetObjectOutput, ObjectStore};

const SCHEME: &str = "memory://";

// ---------------------------------------------------------------------------
// InMemoryObjectStore
// ---------------------------------------------------------------------------

/// In-memory object store for unit and integration tests.
///
/// Objects live in a `HashMap` keyed by canonical id behind a `RwLock`.
/// Each instance has its own namespace, so canonical ids from one store are
/// never valid in another.
pub struct InMemoryObjectStore {
    namespace: String,
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    headers: HeaderMap,
}

impl InMemoryObjectStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn not_found(id: &str) -> StorageError {
        StorageError::NotFound { id: id.to_string() }
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new("default")
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn label(&self) -> &str {
        &self.namespace
    }

    fn id_from_name(&self, name: &str) -> String {
        format!("{}{}/{}", SCHEME, self.namespace, name)
    }

    async fn put(
        &self,
        name: &str,
        data: Bytes,
        mime: &str,
        headers: HeaderMap,
    ) -> Result<String, StorageError> {
        timed_put(&self.namespace, async {
            validate_name(name)?;
            let id = self.id_from_name(name);
            let headers = with_content_headers(headers, mime, data.len());
            let mut objects = self.objects.write().await;
            objects.insert(id.clone(), StoredObject { data, headers });
            Ok(id)
        })
        .await
    }

    async fn get_reader(&self, id: &str) -> Result<GetObjectOutput, StorageError> {
        timed_get(&self.namespace, async {
            let objects = self.objects.read().await;
            let obj = objects.get(id).ok_or_else(|| Self::not_found(id))?;
            Ok(GetObjectOutput {
                body: obj.data.clone(),
                headers: obj.headers.clone(),
            })
        })
        .await
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<String, StorageError> {
        let mut objects = self.objects.write().await;
        let obj = objects.get(src).cloned().ok_or_else(|| Self::not_found(src))?;
        objects.insert(dst.to_string(), obj);
        Ok(dst.to_string())
    }

    async fn expiring_url(&self, id: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.objects.read().await.contains_key(id) {
            return Err(Self::not_found(id));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("{}?expires={}", id, expires))
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
impl InMemoryObjectStore {
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.objects.read().await.contains_key(id)
    }
}
