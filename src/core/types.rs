use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Derive the stable media id for a normalized remote URL.
///
/// The id is the unpadded base64url encoding of the MD5 digest of the URL.
/// It must never change across releases: ids are persisted and handed out
/// to clients.
pub fn media_id(url: &str) -> String {
    let digest = Md5::digest(url.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Key under which a media record is cached.
pub fn cache_key(id: &str) -> String {
    format!("mediaproxy:{}", id)
}

// ---------------------------------------------------------------------------
// Media record
// ---------------------------------------------------------------------------

/// Fetch state of a proxied URL.
///
/// ```text
/// NOT_FETCHED ──► STORED
///      │
///      ├──────► FAILED_TEMP ──(backoff elapsed)──► fetch again
///      │              │
///      └──────► FAILED_PERM ◄──(max attempts)─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MediaStatus {
    #[default]
    #[serde(rename = "")]
    NotFetched,
    #[serde(rename = "STORED")]
    Stored,
    #[serde(rename = "FAILED_TEMP")]
    FailedTransient,
    #[serde(rename = "FAILED_PERM")]
    FailedPermanent,
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaStatus::NotFetched => write!(f, "not_fetched"),
            MediaStatus::Stored => write!(f, "stored"),
            MediaStatus::FailedTransient => write!(f, "failed_transient"),
            MediaStatus::FailedPermanent => write!(f, "failed_permanent"),
        }
    }
}

/// Metadata for one proxied remote URL.
///
/// Serialized with the same field names wherever it is persisted (memcache
/// value, SQLite blob) so records written by one backend are readable by any
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Media {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub status: MediaStatus,
    #[serde(with = "zero_time")]
    pub last_fetch: Option<DateTime<Utc>>,
    pub fetch_attempts: u32,
    pub fail_reason: String,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub size: u64,
}

impl Media {
    /// A record for a URL that has been observed but never fetched.
    pub fn not_fetched(url: &str) -> Self {
        Self {
            id: media_id(url),
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// How long after `last_fetch` a transiently failed record must wait
    /// before it is fetched again: `base × 2^fetch_attempts`.
    pub fn backoff_window(&self, base: Duration) -> Duration {
        let factor = 1u32.checked_shl(self.fetch_attempts).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
    }

    /// Whether a `FailedTransient` record is still inside its backoff window.
    pub fn in_backoff(&self, base: Duration, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_fetch else {
            return false;
        };
        let window = chrono::Duration::from_std(self.backoff_window(base))
            .unwrap_or(chrono::Duration::MAX);
        match last.checked_add_signed(window) {
            Some(retry_at) => now < retry_at,
            None => true,
        }
    }

    /// Record a failed fetch attempt.
    pub fn record_failure(&mut self, status: MediaStatus, reason: String, now: DateTime<Utc>) {
        self.status = status;
        self.last_fetch = Some(now);
        self.fetch_attempts = self.fetch_attempts.saturating_add(1);
        self.fail_reason = reason;
    }

    /// Record a successful fetch, copying what was actually stored.
    pub fn record_stored(&mut self, meta: &ImageMeta, now: DateTime<Utc>) {
        self.status = MediaStatus::Stored;
        self.last_fetch = Some(now);
        self.fail_reason.clear();
        self.width = meta.width;
        self.height = meta.height;
        self.mime_type = meta.mime_type.clone();
        self.size = meta.size;
    }
}

/// Serde adapter writing `None` as the zero timestamp `0001-01-01T00:00:00Z`
/// so the persisted format always carries an RFC 3339 string.
mod zero_time {
    use chrono::{DateTime, Datelike, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const ZERO: &str = "0001-01-01T00:00:00Z";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_str(ZERO),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        if raw.is_empty() || raw == ZERO {
            return Ok(None);
        }
        let parsed = DateTime::parse_from_rfc3339(&raw)
            .map_err(serde::de::Error::custom)?
            .with_timezone(&Utc);
        if parsed.year() <= 1 {
            return Ok(None);
        }
        Ok(Some(parsed))
    }
}

// ---------------------------------------------------------------------------
// Image sizes and metadata
// ---------------------------------------------------------------------------

/// A requested output size. Zero in a dimension means "derive from the other".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub allow_scale_up: bool,
    #[serde(default)]
    pub crop: bool,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            allow_scale_up: false,
            crop: false,
        }
    }

    pub fn cropped(mut self) -> Self {
        self.crop = true;
        self
    }

    pub fn scale_up(mut self) -> Self {
        self.allow_scale_up = true;
        self
    }

    /// True when no resizing is requested at all.
    pub fn is_original(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// Name of the resized copy of `id` in the variants store.
    pub fn variant_name(&self, id: &str) -> String {
        format!(
            "{}-{}x{}-up_{}-crop_{}",
            id, self.width, self.height, self.allow_scale_up, self.crop
        )
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)?;
        if self.crop {
            write!(f, " crop")?;
        }
        if self.allow_scale_up {
            write!(f, " up")?;
        }
        Ok(())
    }
}

/// Attributes of a stored image, reconstructed from object headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub name: Option<String>,
}
