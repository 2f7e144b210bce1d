use std::collections::HashMap;
use std::time::Duration;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::core::config::StorageConfig;
use crate::core::error::StorageError;
use crate::observability::metrics as obs;

use super::{timed_get, timed_put, validate_name, GetObjectOutput, ObjectStore};

// ---------------------------------------------------------------------------
// Retry constants
// ---------------------------------------------------------------------------

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Prefix S3 adds to user metadata when it is returned as HTTP headers.
const USER_META_PREFIX: &str = "x-amz-meta-";

// ---------------------------------------------------------------------------
// S3ObjectStore
// ---------------------------------------------------------------------------

/// Object store backed by S3 or an S3-compatible service.
///
/// Canonical ids have the form `s3://<region>/<bucket>/<prefix><name>`.
/// Image attributes travel as S3 user metadata, so `x-amz-meta-width` on
/// put comes back verbatim on get.
pub struct S3ObjectStore {
    label: String,
    client: Client,
    region: String,
    bucket: String,
    prefix: String,
    request_timeout: Duration,
}

impl S3ObjectStore {
    /// Build a store from configuration. `sub_prefix` separates the variants
    /// namespace (`cache/`) from the originals.
    pub fn new(label: &str, config: &StorageConfig, sub_prefix: &str) -> Self {
        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if !config.access_key_id.is_empty() {
            let credentials = Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "mediaproxy-config",
            );
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        }
        if !config.endpoint.is_empty() {
            s3_config_builder = s3_config_builder.endpoint_url(&config.endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        let mut prefix = config.prefix.trim_matches('/').to_string();
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(sub_prefix);

        Self {
            label: label.to_string(),
            client,
            region: config.region.clone(),
            bucket: config.bucket.clone(),
            prefix,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    fn id_prefix(&self) -> String {
        format!("s3://{}/{}/", self.region, self.bucket)
    }

    /// Object key for a canonical id of this store.
    fn key_for_id(&self, id: &str) -> Result<String, StorageError> {
        let key = id
            .strip_prefix(&self.id_prefix())
            .filter(|k| k.starts_with(&self.prefix))
            .ok_or_else(|| StorageError::GetFailed {
                id: id.to_string(),
                reason: "id does not belong to this store".to_string(),
            })?;
        Ok(key.to_string())
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(INITIAL_BACKOFF_MS * (1 << (attempt - 1)))
    }

    /// Execute a PUT with retry logic.
    async fn put_with_retry(
        &self,
        key: &str,
        body: Bytes,
        mime: &str,
        user_meta: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = Self::backoff(attempt);
                debug!(key, attempt, backoff_ms = backoff.as_millis(), "retrying S3 PUT");
                obs::inc_storage_retries("put");
                tokio::time::sleep(backoff).await;
            }

            let request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(body.clone()))
                .content_type(mime)
                .content_length(body.len() as i64)
                .set_metadata(Some(user_meta.clone()))
                .send();

            match tokio::time::timeout(self.request_timeout, request).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => {
                    let err_str = e.to_string();
                    // Don't retry 403 (forbidden): misconfigured credentials
                    if err_str.contains("403") || err_str.contains("Forbidden") {
                        return Err(StorageError::PutFailed {
                            id: key.to_string(),
                            reason: format!("forbidden (credentials issue): {}", err_str),
                        });
                    }
                    warn!(key, attempt, error = %err_str, "S3 PUT failed");
                }
                Err(_) => warn!(key, attempt, "S3 PUT timed out"),
            }
        }

        Err(StorageError::RetriesExhausted {
            id: key.to_string(),
        })
    }

    /// Execute a GET with retry logic.
    async fn get_with_retry(&self, id: &str, key: &str) -> Result<GetObjectOutput, StorageError> {
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                obs::inc_storage_retries("get");
                tokio::time::sleep(Self::backoff(attempt)).await;
            }

            let request = self.client.get_object().bucket(&self.bucket).key(key).send();
            let output = match tokio::time::timeout(self.request_timeout, request).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    let no_such_key = e
                        .as_service_error()
                        .map(|se| se.is_no_such_key())
                        .unwrap_or(false);
                    let err_str = e.to_string();
                    // Don't retry 404: object doesn't exist
                    if no_such_key || err_str.contains("NoSuchKey") || err_str.contains("404") {
                        return Err(StorageError::NotFound { id: id.to_string() });
                    }
                    if err_str.contains("403") || err_str.contains("Forbidden") {
                        return Err(StorageError::GetFailed {
                            id: id.to_string(),
                            reason: format!("forbidden: {}", err_str),
                        });
                    }
                    warn!(key, attempt, error = %err_str, "S3 GET failed");
                    continue;
                }
                Err(_) => {
                    warn!(key, attempt, "S3 GET timed out");
                    continue;
                }
            };

            let mut headers = HeaderMap::new();
            if let Some(value) = output.content_type().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(CONTENT_TYPE, value);
            }
            if let Some(len) = output.content_length() {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
            if let Some(meta) = output.metadata() {
                for (k, v) in meta {
                    let name = format!("{}{}", USER_META_PREFIX, k.to_ascii_lowercase());
                    if let (Ok(name), Ok(value)) =
                        (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(v))
                    {
                        headers.insert(name, value);
                    }
                }
            }

            let body = output
                .body
                .collect()
                .await
                .map_err(|e| StorageError::GetFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                })?
                .into_bytes();

            return Ok(GetObjectOutput { body, headers });
        }

        Err(StorageError::RetriesExhausted { id: id.to_string() })
    }
}

/// Strip `x-amz-meta-` from header names to build the S3 user metadata map.
fn user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| {
            let name = k.as_str().strip_prefix(USER_META_PREFIX)?;
            Some((name.to_string(), v.to_str().ok()?.to_string()))
        })
        .collect()
}

impl ObjectStore for S3ObjectStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn id_from_name(&self, name: &str) -> String {
        format!("{}{}{}", self.id_prefix(), self.prefix, name)
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
            let key = format!("{}{}", self.prefix, name);
            self.put_with_retry(&key, data, mime, user_metadata(&headers))
                .await?;
            Ok(self.id_from_name(name))
        })
        .await
    }

    async fn get_reader(&self, id: &str) -> Result<GetObjectOutput, StorageError> {
        timed_get(&self.label, async {
            let key = self.key_for_id(id)?;
            self.get_with_retry(id, &key).await
        })
        .await
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<String, StorageError> {
        let src_key = self.key_for_id(src)?;
        let dst_key = self.key_for_id(dst)?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .key(&dst_key)
            .send()
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("NoSuchKey") || err_str.contains("404") {
                    StorageError::NotFound { id: src.to_string() }
                } else {
                    StorageError::CopyFailed {
                        dst: dst.to_string(),
                        src: src.to_string(),
                        reason: err_str,
                    }
                }
            })?;
        Ok(dst.to_string())
    }

    async fn expiring_url(&self, id: &str, ttl: Duration) -> Result<String, StorageError> {
        let key = self.key_for_id(id)?;
        let sign_err = |reason: String| StorageError::SignFailed {
            id: id.to_string(),
            reason,
        };
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| sign_err(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|e| sign_err(e.to_string()))?;
        Ok(request.uri().to_string())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let key = self.key_for_id(id)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StorageError::PutFailed {
                id: id.to_string(),
                reason: format!("delete failed: {}", e),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use crate::storage::image_headers;

    fn store(sub_prefix: &str) -> S3ObjectStore {
        let mut config = AppConfig::default().storage;
        config.backend = "s3".to_string();
        config.bucket = "media".to_string();
        config.prefix = "proxy/".to_string();
        config.region = "us-east-1".to_string();
        S3ObjectStore::new("canonical", &config, sub_prefix)
    }

    #[test]
    fn test_canonical_ids() {
        let canonical = store("");
        let variants = store("cache/");
        assert_eq!(canonical.id_from_name("abc"), "s3://us-east-1/media/proxy/abc");
        assert_eq!(variants.id_from_name("abc"), "s3://us-east-1/media/proxy/cache/abc");

        let id = canonical.id_from_name("abc");
        assert_eq!(canonical.key_for_id(&id).unwrap(), "proxy/abc");
        assert!(variants.key_for_id(&id).is_err());
        assert!(canonical.key_for_id("s3://eu-west-1/other/abc").is_err());
    }

    #[test]
    fn test_user_metadata_strips_prefix() {
        let meta = user_metadata(&image_headers(10, 20, Some("abc")));
        assert_eq!(meta.get("width").map(String::as_str), Some("10"));
        assert_eq!(meta.get("height").map(String::as_str), Some("20"));
        assert_eq!(meta.get("original-name").map(String::as_str), Some("abc"));
    }
}
