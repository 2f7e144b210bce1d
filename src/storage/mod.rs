pub mod backend;
pub mod filesystem;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::error::StorageError;
use crate::core::types::ImageMeta;
use crate::observability::metrics as obs;

pub use backend::ObjectBackend;

// ---------------------------------------------------------------------------
// Object header names
// ---------------------------------------------------------------------------

/// Pixel width of a stored image.
pub const HEADER_WIDTH: &str = "x-amz-meta-width";
/// Pixel height of a stored image.
pub const HEADER_HEIGHT: &str = "x-amz-meta-height";
/// Name the object was written under before canonicalization.
pub const HEADER_ORIGINAL_NAME: &str = "x-amz-meta-original-name";

// ---------------------------------------------------------------------------
// ObjectStore trait
// ---------------------------------------------------------------------------

/// Content-addressed byte store.
///
/// Objects are written under a plain name and addressed afterwards by the
/// canonical id the backend derives from it (`id_from_name`). Two instances
/// are used side by side, one for originals and one for resized variants,
/// and they must never share a namespace.
pub trait ObjectStore: Send + Sync + 'static {
    /// Short label for metrics and logs (`canonical`, `variants`).
    fn label(&self) -> &str;

    /// Deterministic canonical id for `name` in this backend.
    fn id_from_name(&self, name: &str) -> String;

    /// Write an immutable object. Returns its canonical id.
    ///
    /// `headers` carries the image attributes (`x-amz-meta-width`, ...) that
    /// `get_reader` hands back. `Content-Type` and `Content-Length` are set by
    /// the store.
    fn put(
        &self,
        name: &str,
        data: Bytes,
        mime: &str,
        headers: HeaderMap,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    /// Streaming variant of [`ObjectStore::put`].
    ///
    /// Reads at most `size` bytes; the caller is responsible for bounding
    /// the reader.
    fn put_reader<R>(
        &self,
        name: &str,
        reader: R,
        size: u64,
        mime: &str,
        headers: HeaderMap,
    ) -> impl Future<Output = Result<String, StorageError>> + Send
    where
        R: AsyncRead + Unpin + Send,
    {
        async move {
            let data = read_bounded(reader, size).await?;
            self.put(name, data, mime, headers).await
        }
    }

    /// Read an object by canonical id. `StorageError::NotFound` when absent.
    fn get_reader(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<GetObjectOutput, StorageError>> + Send;

    /// Server-side copy between canonical ids. Returns the destination id.
    fn copy(
        &self,
        dst: &str,
        src: &str,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    /// URL granting read access to `id` for `ttl`.
    fn expiring_url(
        &self,
        id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    /// Remove an object. Deleting a missing object is not an error.
    fn delete(&self, id: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
}

// ---------------------------------------------------------------------------
// Storage types
// ---------------------------------------------------------------------------

/// Output from a GET object operation.
#[derive(Debug, Clone)]
pub struct GetObjectOutput {
    pub body: Bytes,
    pub headers: HeaderMap,
}

impl GetObjectOutput {
    /// Image attributes recorded in the object headers.
    pub fn image_meta(&self) -> ImageMeta {
        let mut meta = image_meta_from_headers(&self.headers);
        if meta.size == 0 {
            meta.size = self.body.len() as u64;
        }
        meta
    }
}

// ---------------------------------------------------------------------------
// Header helpers
// ---------------------------------------------------------------------------

/// Headers describing a stored image.
pub fn image_headers(width: u32, height: u32, original_name: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(HEADER_WIDTH), HeaderValue::from(width));
    headers.insert(HeaderName::from_static(HEADER_HEIGHT), HeaderValue::from(height));
    if let Some(value) = original_name.and_then(|n| HeaderValue::from_str(n).ok()) {
        headers.insert(HeaderName::from_static(HEADER_ORIGINAL_NAME), value);
    }
    headers
}

/// Add the store-managed `Content-Type` and `Content-Length` headers.
pub fn with_content_headers(mut headers: HeaderMap, mime: &str, len: usize) -> HeaderMap {
    if let Ok(value) = HeaderValue::from_str(mime) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers
}

/// Reconstruct [`ImageMeta`] from an object's header map.
///
/// Missing or unparseable values come back as zero / empty; callers decide
/// whether that warrants a decode.
pub fn image_meta_from_headers(headers: &HeaderMap) -> ImageMeta {
    fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }
    fn header_num<T: std::str::FromStr + Default>(headers: &HeaderMap, name: &str) -> T {
        header_str(headers, name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_default()
    }

    ImageMeta {
        mime_type: header_str(headers, CONTENT_TYPE.as_str())
            .unwrap_or_default()
            .to_string(),
        width: header_num(headers, HEADER_WIDTH),
        height: header_num(headers, HEADER_HEIGHT),
        size: header_num(headers, CONTENT_LENGTH.as_str()),
        name: header_str(headers, HEADER_ORIGINAL_NAME).map(str::to_string),
    }
}

/// Object names must stay inside the store's namespace.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let ok = !name.is_empty()
        && name.len() <= 512
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StorageError::PutFailed {
            id: name.to_string(),
            reason: "invalid object name".to_string(),
        })
    }
}

/// Read up to `limit` bytes from `reader`.
pub async fn read_bounded<R>(reader: R, limit: u64) -> Result<Bytes, StorageError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(limit.min(1 << 20) as usize);
    reader.take(limit).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

// ---------------------------------------------------------------------------
// Metric wrappers
// ---------------------------------------------------------------------------

/// Time an object PUT and count failures.
pub async fn timed_put<F>(store: &str, fut: F) -> Result<String, StorageError>
where
    F: Future<Output = Result<String, StorageError>>,
{
    let start = Instant::now();
    let result = fut.await;
    obs::record_storage_put_duration(store, start.elapsed().as_secs_f64());
    if result.is_err() {
        obs::inc_storage_error("put");
    }
    result
}

/// Time an object GET and count failures other than `NotFound`.
pub async fn timed_get<F>(store: &str, fut: F) -> Result<GetObjectOutput, StorageError>
where
    F: Future<Output = Result<GetObjectOutput, StorageError>>,
{
    let start = Instant::now();
    let result = fut.await;
    obs::record_storage_get_duration(store, start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        if !e.is_not_found() {
            obs::inc_storage_error("get");
        }
    }
    result
}
