use std::collections::HashMap;

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::error::{ProxyError, SignatureError};
use crate::core::types::{ImageSize, Media};
use crate::signer::SignedQuery;

use super::router::AppState;

/// Proxied media never changes for a given id and size.
pub const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// Upper bound on URLs in one lookup request.
pub const MAX_LOOKUP_URLS: usize = 1000;

/// Account a signed URL was issued to, set by the authenticating gateway.
pub static X_ACCOUNT_ID: HeaderName = HeaderName::from_static("x-account-id");

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    status: u16,
}

fn error_json(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
        status: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

fn proxy_error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "media request failed");
    } else {
        debug!(error = %err, "media request rejected");
    }
    error_json(status, err.error_code(), &err.to_string())
}

fn signature_error_response(err: &SignatureError) -> Response {
    debug!(error = %err, "signed url rejected");
    match err {
        SignatureError::Malformed => {
            error_json(StatusCode::BAD_REQUEST, "malformed_signed_url", &err.to_string())
        }
        SignatureError::Expired { .. } => {
            error_json(StatusCode::FORBIDDEN, "signature_expired", &err.to_string())
        }
        SignatureError::Mismatch | SignatureError::NoKeys => {
            error_json(StatusCode::FORBIDDEN, "invalid_signature", &err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Query of `GET /media/proxy/{id}`. Flags accept `true` or `1`.
#[derive(Debug, Default, Deserialize)]
pub struct SizeQuery {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub crop: Option<String>,
    #[serde(default)]
    pub scale_up: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true"))
}

impl SizeQuery {
    pub fn size(&self) -> Option<ImageSize> {
        if self.width == 0 && self.height == 0 {
            return None;
        }
        Some(ImageSize {
            width: self.width,
            height: self.height,
            allow_scale_up: flag(&self.scale_up),
            crop: flag(&self.crop),
        })
    }
}

/// `GET /media/proxy/{id}`
pub async fn serve_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SizeQuery>,
) -> Response {
    media_response(&state, &id, query.size().as_ref()).await
}

/// `GET /media/signed?id=…&mimetype=…[&width&height&crop&expires]&sig=…`
///
/// The signature covers the caller's account, taken from `X-Account-Id`.
pub async fn serve_signed(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let Some(signer) = &state.signer else {
        return error_json(StatusCode::NOT_FOUND, "signing_disabled", "signed urls are disabled");
    };
    let query = match SignedQuery::parse(query.as_deref().unwrap_or_default()) {
        Ok(q) => q,
        Err(e) => return signature_error_response(&e),
    };
    let account_id = headers
        .get(&X_ACCOUNT_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let (fields, sig) = query.into_fields(account_id);
    if let Err(e) = signer.verify(&fields, &sig) {
        return signature_error_response(&e);
    }

    let size = (fields.width > 0 || fields.height > 0).then(|| ImageSize {
        width: fields.width,
        height: fields.height,
        allow_scale_up: false,
        crop: fields.crop,
    });
    media_response(&state, &fields.media_id, size.as_ref()).await
}

async fn media_response(state: &AppState, id: &str, size: Option<&ImageSize>) -> Response {
    match state.proxy.image_reader(id, size).await {
        Ok((body, media)) => {
            // Variants of GIFs are JPEG; sniff rather than trust the record.
            let mime = crate::image::probe(&body)
                .map(|(mime, _, _)| mime.to_string())
                .unwrap_or(media.mime_type);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, mime),
                    (header::CACHE_CONTROL, CACHE_CONTROL_IMMUTABLE.to_string()),
                ],
                body,
            )
                .into_response()
        }
        Err(e) => proxy_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LookupRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    pub media: HashMap<String, Media>,
}

/// `POST /media/proxy/lookup`
pub async fn lookup(State(state): State<AppState>, Json(req): Json<LookupRequest>) -> Response {
    if req.urls.len() > MAX_LOOKUP_URLS {
        return proxy_error_response(&ProxyError::InvalidInput {
            reason: format!("at most {} urls per lookup", MAX_LOOKUP_URLS),
        });
    }
    match state.proxy.lookup_by_url(&req.urls).await {
        Ok(media) => Json(LookupResponse { media }).into_response(),
        Err(e) => {
            warn!(urls = req.urls.len(), error = %e, "lookup failed");
            proxy_error_response(&e)
        }
    }
}

// ---------------------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------------------

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => error_json(StatusCode::NOT_FOUND, "metrics_disabled", "metrics are disabled"),
    }
}

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(width: u32, height: u32, crop: Option<&str>, scale_up: Option<&str>) -> SizeQuery {
        SizeQuery {
            width,
            height,
            crop: crop.map(str::to_string),
            scale_up: scale_up.map(str::to_string),
        }
    }

    #[test]
    fn test_size_query() {
        assert_eq!(query(0, 0, Some("true"), None).size(), None);
        assert_eq!(query(100, 0, None, None).size(), Some(ImageSize::new(100, 0)));
        assert_eq!(
            query(100, 50, Some("1"), Some("true")).size(),
            Some(ImageSize::new(100, 50).cropped().scale_up())
        );
        assert_eq!(query(100, 50, Some("false"), Some("0")).size(), Some(ImageSize::new(100, 50)));
    }
}
