//! HMAC-signed media URLs.
//!
//! A signed URL names a media id and variant and carries an HMAC-SHA256 tag
//! over those fields plus the account it was issued to:
//!
//! ```text
//! <base>?id=…&mimetype=…[&width=…][&height=…][&crop=true][&expires=<unix>]&sig=<b64url>
//! ```
//!
//! The signed message is, big-endian:
//! `u32 width | u32 height | u16 crop | account_id | media_id | mimetype [| u64 expires]`.
//! The expiry suffix is present only on expiring URLs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use crate::core::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Fields covered by a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedFields {
    pub media_id: String,
    pub mime_type: String,
    pub account_id: String,
    pub width: u32,
    pub height: u32,
    pub crop: bool,
    /// Unix seconds. Zero means the URL never expires.
    pub expires: u64,
}

/// Query parameters of a signed URL. The account id is not part of the URL;
/// the verifier supplies it from the authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedQuery {
    pub media_id: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub crop: bool,
    pub expires: u64,
    pub sig: String,
}

impl SignedQuery {
    /// Parse the query string of a signed URL.
    pub fn parse(query: &str) -> Result<Self, SignatureError> {
        let mut q = SignedQuery {
            media_id: String::new(),
            mime_type: String::new(),
            width: 0,
            height: 0,
            crop: false,
            expires: 0,
            sig: String::new(),
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "id" => q.media_id = value.into_owned(),
                "mimetype" => q.mime_type = value.into_owned(),
                "width" => q.width = value.parse().map_err(|_| SignatureError::Malformed)?,
                "height" => q.height = value.parse().map_err(|_| SignatureError::Malformed)?,
                "crop" => q.crop = matches!(value.as_ref(), "1" | "true"),
                "expires" => q.expires = value.parse().map_err(|_| SignatureError::Malformed)?,
                "sig" => q.sig = value.into_owned(),
                _ => {}
            }
        }
        if q.media_id.is_empty() || q.sig.is_empty() {
            return Err(SignatureError::Malformed);
        }
        Ok(q)
    }

    pub fn into_fields(self, account_id: &str) -> (SignedFields, String) {
        (
            SignedFields {
                media_id: self.media_id,
                mime_type: self.mime_type,
                account_id: account_id.to_string(),
                width: self.width,
                height: self.height,
                crop: self.crop,
                expires: self.expires,
            },
            self.sig,
        )
    }
}

/// Fixed-layout message over `fields`.
///
/// The three strings are concatenated without length prefixes or separators,
/// so account `"4"` with media `"2abc"` signs the same bytes as account `"42"`
/// with media `"abc"`. Existing URLs depend on this layout; any new field needs
/// a length prefix or a fixed width.
fn message(fields: &SignedFields) -> Vec<u8> {
    let mut msg = Vec::with_capacity(
        4 + 4 + 2 + fields.account_id.len() + fields.media_id.len() + fields.mime_type.len() + 8,
    );
    msg.extend_from_slice(&fields.width.to_be_bytes());
    msg.extend_from_slice(&fields.height.to_be_bytes());
    msg.extend_from_slice(&u16::from(fields.crop).to_be_bytes());
    msg.extend_from_slice(fields.account_id.as_bytes());
    msg.extend_from_slice(fields.media_id.as_bytes());
    msg.extend_from_slice(fields.mime_type.as_bytes());
    if fields.expires != 0 {
        msg.extend_from_slice(&fields.expires.to_be_bytes());
    }
    msg
}

/// Issues and verifies signed media URLs. The first key signs; any key
/// verifies, so keys can be rotated by prepending a new one.
#[derive(Clone)]
pub struct Signer {
    base_url: Url,
    keys: Vec<HmacSha256>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("base_url", &self.base_url.as_str())
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl Signer {
    pub fn new(base_url: Url, keys: Vec<Vec<u8>>) -> Result<Self, SignatureError> {
        if keys.iter().any(|k| k.is_empty()) {
            return Err(SignatureError::NoKeys);
        }
        let keys = keys
            .iter()
            .map(|k| HmacSha256::new_from_slice(k).map_err(|_| SignatureError::NoKeys))
            .collect::<Result<Vec<_>, _>>()?;
        if keys.is_empty() {
            return Err(SignatureError::NoKeys);
        }
        Ok(Self { base_url, keys })
    }

    fn mac(key: &HmacSha256, msg: &[u8]) -> HmacSha256 {
        let mut mac = key.clone();
        mac.update(msg);
        mac
    }

    /// Base64url signature of `fields` under the signing key.
    pub fn sign(&self, fields: &SignedFields) -> String {
        let tag = Self::mac(&self.keys[0], &message(fields))
            .finalize()
            .into_bytes();
        URL_SAFE_NO_PAD.encode(tag)
    }

    fn build_url(&self, fields: &SignedFields) -> String {
        let sig = self.sign(fields);
        let mut url = self.base_url.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("id", &fields.media_id);
            q.append_pair("mimetype", &fields.mime_type);
            if fields.width > 0 {
                q.append_pair("width", &fields.width.to_string());
            }
            if fields.height > 0 {
                q.append_pair("height", &fields.height.to_string());
            }
            if fields.crop {
                q.append_pair("crop", "true");
            }
            if fields.expires != 0 {
                q.append_pair("expires", &fields.expires.to_string());
            }
            q.append_pair("sig", &sig);
        }
        url.into()
    }

    /// URL for a variant of `media_id` that never expires.
    pub fn signed_url(
        &self,
        media_id: &str,
        mime_type: &str,
        account_id: &str,
        width: u32,
        height: u32,
        crop: bool,
    ) -> String {
        self.build_url(&SignedFields {
            media_id: media_id.to_string(),
            mime_type: mime_type.to_string(),
            account_id: account_id.to_string(),
            width,
            height,
            crop,
            expires: 0,
        })
    }

    /// URL for a variant of `media_id` valid until `expires`.
    #[allow(clippy::too_many_arguments)]
    pub fn expiring_signed_url(
        &self,
        media_id: &str,
        mime_type: &str,
        account_id: &str,
        width: u32,
        height: u32,
        crop: bool,
        expires: DateTime<Utc>,
    ) -> String {
        self.build_url(&SignedFields {
            media_id: media_id.to_string(),
            mime_type: mime_type.to_string(),
            account_id: account_id.to_string(),
            width,
            height,
            crop,
            // Pre-epoch expiries are already past; clamp to the earliest non-zero time.
            expires: u64::try_from(expires.timestamp()).unwrap_or(0).max(1),
        })
    }

    /// Check `sig` against `fields` at `now`.
    pub fn verify_at(
        &self,
        fields: &SignedFields,
        sig: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let tag = URL_SAFE_NO_PAD
            .decode(sig.trim_end_matches('='))
            .map_err(|_| SignatureError::Malformed)?;
        let msg = message(fields);
        let valid = self
            .keys
            .iter()
            .any(|key| Self::mac(key, &msg).verify_slice(&tag).is_ok());
        if !valid {
            return Err(SignatureError::Mismatch);
        }
        if fields.expires != 0 && now.timestamp() > fields.expires as i64 {
            return Err(SignatureError::Expired {
                expires: fields.expires,
            });
        }
        Ok(())
    }

    pub fn verify(&self, fields: &SignedFields, sig: &str) -> Result<(), SignatureError> {
        self.verify_at(fields, sig, Utc::now())
    }

    /// Whether `sig` is valid for the fields and unexpired.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_signature(
        &self,
        media_id: &str,
        mime_type: &str,
        account_id: &str,
        width: u32,
        height: u32,
        crop: bool,
        expires: u64,
        sig: &str,
    ) -> bool {
        let fields = SignedFields {
            media_id: media_id.to_string(),
            mime_type: mime_type.to_string(),
            account_id: account_id.to_string(),
            width,
            height,
            crop,
            expires,
        };
        self.verify(&fields, sig).is_ok()
    }
}
