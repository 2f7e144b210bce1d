use thiserror::Error;

// ---------------------------------------------------------------------------
// Object storage errors
// ---------------------------------------------------------------------------

/// Errors originating from an object store backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {id}")]
    NotFound { id: String },

    #[error("object PUT failed for {id}: {reason}")]
    PutFailed { id: String, reason: String },

    #[error("object GET failed for {id}: {reason}")]
    GetFailed { id: String, reason: String },

    #[error("object COPY failed from {src} to {dst}: {reason}")]
    CopyFailed {
        dst: String,
        src: String,
        reason: String,
    },

    #[error("failed to sign URL for {id}: {reason}")]
    SignFailed { id: String, reason: String },

    #[error("retries exhausted for {id}")]
    RetriesExhausted { id: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

// ---------------------------------------------------------------------------
// Image service errors
// ---------------------------------------------------------------------------

/// Errors originating from the image service.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The decoder rejected the bytes. Always permanent.
    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("image not found: {id}")]
    NotFound { id: String },

    #[error("failed to encode image: {reason}")]
    EncodeFailed { reason: String },

    #[error("requested size {width}x{height} exceeds {max_width}x{max_height}")]
    SizeTooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for ImageError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { id } => ImageError::NotFound { id },
            other => ImageError::Storage(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata errors
// ---------------------------------------------------------------------------

/// Errors from the memcache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `add` found an existing value. Not a failure for read-fill.
    #[error("cache key already exists: {key}")]
    AlreadyExists { key: String },

    #[error("memcache protocol error: {reason}")]
    Protocol { reason: String },

    #[error("memcache server error: {reason}")]
    Server { reason: String },

    #[error("memcache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the metadata store and its cache.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata store error: {reason}")]
    Store { reason: String },

    #[error("metadata cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metadata store and cache both failed: {store}; {cache}")]
    Both { store: String, cache: String },
}

impl From<rusqlite::Error> for MetadataError {
    fn from(err: rusqlite::Error) -> Self {
        MetadataError::Store {
            reason: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote fetch errors
// ---------------------------------------------------------------------------

/// Errors from fetching a remote URL. Status codes are not errors; they are
/// reported on the response and classified by the proxy.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {reason}")]
    Transport { reason: String },

    #[error("response too large: exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("invalid host: {host}")]
    InvalidHost { host: String },
}

// ---------------------------------------------------------------------------
// Proxy errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the media proxy to its embedding layer.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No metadata for the id, or the object went missing from storage.
    #[error("media not found: {id}")]
    NotFound { id: String },

    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    /// The remote fetch failed. Callers branch on `permanent`, never on `reason`.
    #[error("fetch failed (permanent: {permanent}): {reason}")]
    FetchFailed { permanent: bool, reason: String },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("storage error: {reason}")]
    Storage { reason: String },
}

impl ProxyError {
    /// Map to the HTTP status used by the delivery layer.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::NotFound { .. } => 404,
            ProxyError::InvalidImage { .. } => 422,
            ProxyError::FetchFailed {
                permanent: true, ..
            } => 404,
            ProxyError::FetchFailed {
                permanent: false, ..
            } => 502,
            ProxyError::InvalidInput { .. } => 400,
            ProxyError::Storage { .. } => 500,
        }
    }

    /// Error code string for JSON responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::NotFound { .. } => "media_not_found",
            ProxyError::InvalidImage { .. } => "invalid_image",
            ProxyError::FetchFailed {
                permanent: true, ..
            } => "media_unavailable",
            ProxyError::FetchFailed {
                permanent: false, ..
            } => "fetch_failed",
            ProxyError::InvalidInput { .. } => "invalid_input",
            ProxyError::Storage { .. } => "storage_error",
        }
    }
}

impl From<MetadataError> for ProxyError {
    fn from(err: MetadataError) -> Self {
        ProxyError::Storage {
            reason: err.to_string(),
        }
    }
}

impl From<ImageError> for ProxyError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::NotFound { id } => ProxyError::NotFound { id },
            ImageError::InvalidImage { reason } => ProxyError::InvalidImage { reason },
            e @ ImageError::SizeTooLarge { .. } => ProxyError::InvalidInput {
                reason: e.to_string(),
            },
            other => ProxyError::Storage {
                reason: other.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Signature errors
// ---------------------------------------------------------------------------

/// Signed URL verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no signing keys configured")]
    NoKeys,

    #[error("signature is not valid base64url")]
    Malformed,

    #[error("signature does not match")]
    Mismatch,

    #[error("signed URL expired at {expires}")]
    Expired { expires: u64 },
}
