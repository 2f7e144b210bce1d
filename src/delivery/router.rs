use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::metadata::MetadataBackend;
use crate::proxy::{HttpFetcher, MediaProxy};
use crate::signer::Signer;
use crate::storage::ObjectBackend;

use super::handlers;
use super::middleware::RequestIdLayer;

/// Largest accepted JSON body.
const MAX_JSON_BODY_BYTES: usize = 1024 * 1024;

/// Proxy over the backends selected at startup.
pub type AppProxy = MediaProxy<ObjectBackend, MetadataBackend, HttpFetcher>;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<AppProxy>,
    pub start_time: Instant,
    /// `None` when no signing keys are configured.
    pub signer: Option<Arc<Signer>>,
    /// `None` when metrics are disabled.
    pub metrics_handle: Option<PrometheusHandle>,
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let allow_origin = if origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([http::header::CONTENT_TYPE, handlers::X_ACCOUNT_ID.clone()])
        .max_age(std::time::Duration::from_secs(86400))
}

/// Routes:
///
/// - `GET  /media/proxy/{id}`     image bytes, optionally resized
/// - `POST /media/proxy/lookup`   map remote URLs to media records
/// - `GET  /media/signed`         image bytes named by a signed URL
/// - `GET  /healthz`
/// - `GET  /metrics`
pub fn build_router(state: AppState, cors_allowed_origins: &[String]) -> Router {
    tracing::info!(cors_origins = ?cors_allowed_origins, "building router");

    Router::new()
        .route("/media/proxy/lookup", post(handlers::lookup))
        .route("/media/proxy/{id}", get(handlers::serve_media))
        .route("/media/signed", get(handlers::serve_signed))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors_layer(cors_allowed_origins))
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY_BYTES))
        .layer(RequestIdLayer)
        .with_state(state)
}
