use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::error::MetadataError;
use crate::core::types::Media;

use super::MetadataStore;

/// In-process metadata store. The map is guarded by a reader/writer lock.
#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    records: Arc<RwLock<HashMap<String, Media>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, ids: &[String]) -> Result<Vec<Media>, MetadataError> {
        let records = self.records.read().await;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn put(&self, media: &[Media]) -> Result<(), MetadataError> {
        let mut records = self.records.write().await;
        for m in media {
            records.insert(m.id.clone(), m.clone());
        }
        Ok(())
    }
}
