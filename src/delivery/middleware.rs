use std::task::{Context, Poll};

use axum::http::{header::HeaderName, HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// X-Request-Id middleware
// ---------------------------------------------------------------------------

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Longest client-supplied request id that is propagated.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Propagates `X-Request-Id` from request to response, generating a UUIDv4
/// when the client sent none (or an unusable one), and runs the request
/// inside a span carrying the id.
#[derive(Clone)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdMiddleware { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdMiddleware<S> {
    inner: S,
}

fn request_id_from<B>(req: &Request<B>) -> Option<HeaderValue> {
    let value = req.headers().get(&X_REQUEST_ID)?;
    let s = value.to_str().ok()?;
    (!s.is_empty() && s.len() <= MAX_REQUEST_ID_LEN).then(|| value.clone())
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestIdMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let request_id = match request_id_from(&req) {
            Some(value) => value,
            None => {
                let generated = Uuid::new_v4().to_string();
                match HeaderValue::from_str(&generated) {
                    Ok(value) => value,
                    Err(_) => HeaderValue::from_static("unknown"),
                }
            }
        };
        req.headers_mut()
            .insert(X_REQUEST_ID.clone(), request_id.clone());

        let span = tracing::info_span!(
            "request",
            request_id = request_id.to_str().unwrap_or_default(),
            method = %req.method(),
            path = %req.uri().path(),
        );

        // Take the service that was polled ready, leaving a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                let mut response = inner.call(req).await?;
                response
                    .headers_mut()
                    .insert(X_REQUEST_ID.clone(), request_id);
                Ok(response)
            }
            .instrument(span),
        )
    }
}
