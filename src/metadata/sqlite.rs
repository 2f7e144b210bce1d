use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, warn};

use crate::core::error::MetadataError;
use crate::core::types::Media;

use super::MetadataStore;

/// SQLite's default limit on bound parameters per statement.
const MAX_PARAMS: usize = 999;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS media (
        id   TEXT PRIMARY KEY NOT NULL,
        data BLOB NOT NULL
    );
";

/// Durable metadata store: one row per id holding the JSON-encoded record.
///
/// rusqlite is synchronous, so every call runs on the blocking pool with the
/// connection behind a mutex.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| MetadataError::Store {
                reason: format!("failed to create {}: {}", parent.display(), e),
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, MetadataError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MetadataError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn get_sync(&self, ids: &[String]) -> Result<Vec<Media>, MetadataError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(MAX_PARAMS) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT id, data FROM media WHERE id IN ({})", placeholders);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            for row in rows {
                let (id, data) = row?;
                match serde_json::from_slice::<Media>(&data) {
                    Ok(media) => out.push(media),
                    Err(e) => warn!(id = %id, error = %e, "skipping undecodable media record"),
                }
            }
        }

        Ok(out)
    }

    fn put_sync(&self, media: &[Media]) -> Result<(), MetadataError> {
        let encoded = media
            .iter()
            .map(|m| Ok((m.id.as_str(), serde_json::to_vec(m)?)))
            .collect::<Result<Vec<_>, MetadataError>>()?;

        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR REPLACE INTO media (id, data) VALUES (?1, ?2)")?;
            for (id, data) in &encoded {
                stmt.execute(params![id, data])?;
            }
        }
        tx.commit()?;
        debug!(count = encoded.len(), "media records written");
        Ok(())
    }
}

impl MetadataStore for SqliteMetadataStore {
    async fn get(&self, ids: &[String]) -> Result<Vec<Media>, MetadataError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.clone();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || store.get_sync(&ids))
            .await
            .map_err(|e| MetadataError::Store {
                reason: format!("task join error: {}", e),
            })?
    }

    async fn put(&self, media: &[Media]) -> Result<(), MetadataError> {
        if media.is_empty() {
            return Ok(());
        }
        let store = self.clone();
        let media = media.to_vec();
        tokio::task::spawn_blocking(move || store.put_sync(&media))
            .await
            .map_err(|e| MetadataError::Store {
                reason: format!("task join error: {}", e),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MediaStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        let mut a = Media::not_fetched("http://example.com/a.png");
        a.record_failure(MediaStatus::FailedTransient, "request failed: reset".to_string(), Utc::now());
        let b = Media::not_fetched("http://example.com/b.png");
        store.put(&[a.clone(), b.clone()]).await.unwrap();

        let mut got = store
            .get(&[a.id.clone(), b.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        got.sort_by(|x, y| x.url.cmp(&y.url));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].status, MediaStatus::FailedTransient);
        assert_eq!(got[0].fetch_attempts, 1);
        assert_eq!(got[1], b);
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        let mut a = Media::not_fetched("http://example.com/a.png");
        store.put(std::slice::from_ref(&a)).await.unwrap();
        a.status = MediaStatus::FailedPermanent;
        a.fail_reason = "Not Found".to_string();
        store.put(std::slice::from_ref(&a)).await.unwrap();

        let got = store.get(std::slice::from_ref(&a.id)).await.unwrap();
        assert_eq!(got, vec![a]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metadata.db");
        let a = Media::not_fetched("http://example.com/a.png");

        {
            let store = SqliteMetadataStore::open(&path).unwrap();
            store.put(std::slice::from_ref(&a)).await.unwrap();
        }

        let store = SqliteMetadataStore::open(&path).unwrap();
        assert_eq!(store.get(std::slice::from_ref(&a.id)).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_blob_uses_shared_json_format() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        let a = Media::not_fetched("http://example.com/a.png");
        store.put(std::slice::from_ref(&a)).await.unwrap();

        let conn = store.conn.lock().unwrap();
        let data: Vec<u8> = conn
            .query_row("SELECT data FROM media WHERE id = ?1", [&a.id], |row| row.get(0))
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(json["URL"], "http://example.com/a.png");
        assert_eq!(json["Status"], "");
    }
}
