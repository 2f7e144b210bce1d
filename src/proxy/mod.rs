pub mod fetch;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::core::config::ProxyConfig;
use crate::core::error::{FetchError, ImageError, ProxyError};
use crate::core::security::{check_resolved_addrs, parse_remote_url};
use crate::core::types::{media_id, ImageMeta, ImageSize, Media, MediaStatus};
use crate::image::ImageService;
use crate::metadata::MetadataStore;
use crate::observability::metrics as obs;
use crate::storage::ObjectStore;

pub use fetch::{FetchResponse, HttpFetcher, RemoteFetcher};

/// Reason recorded when a remote body exceeds the source size bound.
pub const REASON_TOO_LARGE: &str = "response too large";

/// Classified result of one failed fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchFailure {
    permanent: bool,
    reason: String,
}

impl FetchFailure {
    fn permanent(reason: impl Into<String>) -> Self {
        Self {
            permanent: true,
            reason: reason.into(),
        }
    }

    fn transient(reason: impl Into<String>) -> Self {
        Self {
            permanent: false,
            reason: reason.into(),
        }
    }
}

impl From<FetchError> for FetchFailure {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transport { .. } => FetchFailure::transient(err.to_string()),
            FetchError::TooLarge { .. } => FetchFailure::permanent(REASON_TOO_LARGE),
            FetchError::InvalidHost { .. } => FetchFailure::permanent(err.to_string()),
        }
    }
}

/// Classify a non-200 status. Missing and access-denied resources are not
/// expected to come back.
fn classify_status(status: StatusCode) -> FetchFailure {
    let reason = status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    match status {
        StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchFailure::permanent(reason)
        }
        _ => FetchFailure::transient(reason),
    }
}

// ---------------------------------------------------------------------------
// MediaProxy
// ---------------------------------------------------------------------------

/// Maps remote URLs to stable ids and serves their images, fetching each
/// one on first use.
pub struct MediaProxy<O, M, F> {
    images: ImageService<O>,
    metadata: M,
    fetcher: F,
    backoff_base: Duration,
    max_attempts: u32,
}

impl<O, M, F> MediaProxy<O, M, F>
where
    O: ObjectStore,
    M: MetadataStore,
    F: RemoteFetcher,
{
    pub fn new(images: ImageService<O>, metadata: M, fetcher: F, config: &ProxyConfig) -> Self {
        Self {
            images,
            metadata,
            fetcher,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_attempts: config.max_fetch_attempts.max(1),
        }
    }

    pub fn images(&self) -> &ImageService<O> {
        &self.images
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Resolve remote URLs to their media records, creating `NotFetched`
    /// records for URLs seen for the first time.
    ///
    /// URLs that fail the filter are dropped from the result. The map is
    /// keyed by the URL as given.
    pub async fn lookup_by_url(&self, urls: &[String]) -> Result<HashMap<String, Media>, ProxyError> {
        let mut by_id: HashMap<String, Vec<&String>> = HashMap::new();
        let mut filtered = 0u64;
        for raw in urls {
            match parse_remote_url(raw) {
                Ok(_) => by_id.entry(media_id(raw.trim())).or_default().push(raw),
                Err(reason) => {
                    filtered += 1;
                    info!(url = %raw, reason = %reason, "filtered url from lookup");
                }
            }
        }
        obs::add_lookup_urls("filtered", filtered);

        let mut out = HashMap::with_capacity(urls.len());
        if by_id.is_empty() {
            return Ok(out);
        }

        let ids: Vec<String> = by_id.keys().cloned().collect();
        let existing = self.metadata.get(&ids).await?;
        obs::add_lookup_urls("existing", existing.len() as u64);

        let mut known: HashMap<String, Media> =
            existing.into_iter().map(|m| (m.id.clone(), m)).collect();
        let mut created = Vec::new();
        for (id, raws) in &by_id {
            if !known.contains_key(id) {
                let media = Media::not_fetched(raws[0].trim());
                created.push(media.clone());
                known.insert(id.clone(), media);
            }
        }

        if !created.is_empty() {
            obs::add_lookup_urls("created", created.len() as u64);
            self.metadata.put(&created).await?;
            debug!(count = created.len(), "created media records");
        }

        for (id, raws) in by_id {
            if let Some(media) = known.get(&id) {
                for raw in raws {
                    out.insert(raw.clone(), media.clone());
                }
            }
        }
        Ok(out)
    }

    /// Image bytes for `id` at `size` (the original when `None`), with the
    /// media record.
    ///
    /// Fetches the remote URL when the record has never been fetched or a
    /// transient failure's backoff has elapsed. Fetch failures are recorded
    /// on the record and returned as [`ProxyError::FetchFailed`].
    pub async fn image_reader(
        &self,
        id: &str,
        size: Option<&ImageSize>,
    ) -> Result<(Bytes, Media), ProxyError> {
        if let Some(size) = size {
            self.images.check_size(size)?;
        }
        let mut media = self
            .metadata
            .get(&[id.to_string()])
            .await?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| ProxyError::NotFound { id: id.to_string() })?;

        match media.status {
            MediaStatus::Stored => return self.read_stored(media, size).await,
            MediaStatus::FailedPermanent => {
                return Err(ProxyError::FetchFailed {
                    permanent: true,
                    reason: media.fail_reason,
                })
            }
            MediaStatus::FailedTransient if media.in_backoff(self.backoff_base, Utc::now()) => {
                debug!(id, attempts = media.fetch_attempts, "in backoff, not fetching");
                return Err(ProxyError::FetchFailed {
                    permanent: false,
                    reason: media.fail_reason,
                });
            }
            MediaStatus::NotFetched | MediaStatus::FailedTransient => {}
        }

        let start = Instant::now();
        let outcome = self.fetch_and_store(&media).await;
        obs::record_fetch_duration(start.elapsed().as_secs_f64());
        let now = Utc::now();

        match outcome {
            Ok(meta) => {
                obs::inc_fetch("stored");
                media.record_stored(&meta, now);
                info!(id, url = %media.url, width = meta.width, height = meta.height, "fetched remote media");
                self.save(&media).await;
                let (body, _) = self.images.get_reader(id, size).await?;
                Ok((body, media))
            }
            Err(failure) => {
                let mut status = if failure.permanent {
                    MediaStatus::FailedPermanent
                } else {
                    MediaStatus::FailedTransient
                };
                media.record_failure(status, failure.reason.clone(), now);
                if media.fetch_attempts >= self.max_attempts {
                    status = MediaStatus::FailedPermanent;
                    media.status = status;
                }
                obs::inc_fetch(if status == MediaStatus::FailedPermanent {
                    "failed_permanent"
                } else {
                    "failed_transient"
                });
                warn!(
                    id,
                    url = %media.url,
                    status = %status,
                    attempts = media.fetch_attempts,
                    reason = %failure.reason,
                    "remote fetch failed"
                );
                self.save(&media).await;
                Err(ProxyError::FetchFailed {
                    permanent: status == MediaStatus::FailedPermanent,
                    reason: failure.reason,
                })
            }
        }
    }

    async fn read_stored(
        &self,
        mut media: Media,
        size: Option<&ImageSize>,
    ) -> Result<(Bytes, Media), ProxyError> {
        let (body, meta) = match self.images.get_reader(&media.id, size).await {
            Ok(found) => found,
            Err(ImageError::NotFound { .. }) => {
                warn!(id = %media.id, "media marked stored but object is missing");
                return Err(ProxyError::NotFound { id: media.id });
            }
            Err(e) => return Err(e.into()),
        };

        let original = size.map_or(true, ImageSize::is_original);
        if original && (media.width == 0 || media.height == 0 || media.mime_type.is_empty()) {
            debug!(id = %media.id, "refreshing media record from stored object");
            media.width = meta.width;
            media.height = meta.height;
            media.mime_type = meta.mime_type;
            media.size = meta.size;
            self.save(&media).await;
        }
        Ok((body, media))
    }

    /// Fetch the remote URL and store the image. Never touches metadata.
    async fn fetch_and_store(&self, media: &Media) -> Result<ImageMeta, FetchFailure> {
        let url = parse_remote_url(&media.url)
            .map_err(|reason| FetchFailure::from(FetchError::InvalidHost { host: reason }))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let addrs = self.fetcher.resolve(&host, port).await?;
        check_resolved_addrs(&host, &addrs)?;

        let response = self
            .fetcher
            .fetch(&url, self.images.max_source_bytes())
            .await?;
        if response.status != StatusCode::OK {
            return Err(classify_status(response.status));
        }

        match self.images.put_bytes(&media.id, response.body).await {
            Ok(meta) => Ok(meta),
            Err(ImageError::InvalidImage { reason }) => {
                Err(FetchFailure::permanent(format!("invalid image: {}", reason)))
            }
            Err(e) => Err(FetchFailure::transient(e.to_string())),
        }
    }

    /// Persist a record after a fetch. The result has already been decided,
    /// so failures are only logged.
    async fn save(&self, media: &Media) {
        if let Err(e) = self.metadata.put(std::slice::from_ref(media)).await {
            obs::inc_background_write_failure("metadata");
            warn!(id = %media.id, error = %e, "failed to persist media record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ImageConfig;
    use crate::image::test_support::png_bytes;
    use crate::metadata::MemoryMetadataStore;
    use crate::storage::memory::InMemoryObjectStore;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    const LIVE: &str = "http://sprucehealth.com/img-live.jpg";
    const DEAD: &str = "http://sprucehealth.com/img-dead.jpg";
    const ERR: &str = "http://sprucehealth.com/img-err.jpg";

    #[derive(Clone)]
    enum Reply {
        Ok(Bytes),
        Status(StatusCode),
        Transport,
        TooLarge,
        /// The connection was refused by the resolver guard, e.g. on a redirect.
        Blocked(&'static str),
    }

    /// Fetcher answering from a script keyed by URL and counting requests.
    #[derive(Default)]
    struct ScriptedFetcher {
        replies: Mutex<HashMap<String, Reply>>,
        hosts: Mutex<HashMap<String, IpAddr>>,
        unresolvable: Mutex<Vec<String>>,
        requests: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn reply(self, url: &str, reply: Reply) -> Self {
            self.replies.lock().unwrap().insert(url.to_string(), reply);
            self
        }

        fn host(self, host: &str, ip: &str) -> Self {
            self.hosts
                .lock()
                .unwrap()
                .insert(host.to_string(), ip.parse().unwrap());
            self
        }

        fn unresolvable(self, host: &str) -> Self {
            self.unresolvable.lock().unwrap().push(host.to_string());
            self
        }

        fn set_reply(&self, url: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(url.to_string(), reply);
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    impl RemoteFetcher for ScriptedFetcher {
        async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<IpAddr>, FetchError> {
            if self.unresolvable.lock().unwrap().iter().any(|h| h == host) {
                return Err(FetchError::Transport {
                    reason: format!("dns lookup for {} failed: timed out", host),
                });
            }
            let hosts = self.hosts.lock().unwrap();
            Ok(hosts
                .get(host)
                .copied()
                .map(|ip| vec![ip])
                .unwrap_or_else(|| vec!["93.184.216.34".parse().unwrap()]))
        }

        async fn fetch(&self, url: &Url, _max_bytes: u64) -> Result<FetchResponse, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().get(url.as_str()).cloned();
            match reply {
                Some(Reply::Ok(body)) => Ok(FetchResponse {
                    status: StatusCode::OK,
                    body,
                }),
                Some(Reply::Status(status)) => Ok(FetchResponse {
                    status,
                    body: Bytes::new(),
                }),
                Some(Reply::TooLarge) => Err(FetchError::TooLarge { limit: 1024 }),
                Some(Reply::Blocked(host)) => Err(FetchError::InvalidHost {
                    host: host.to_string(),
                }),
                Some(Reply::Transport) | None => Err(FetchError::Transport {
                    reason: "connection reset".to_string(),
                }),
            }
        }
    }

    type TestProxy = MediaProxy<InMemoryObjectStore, MemoryMetadataStore, ScriptedFetcher>;

    fn proxy_with(fetcher: ScriptedFetcher, backoff_base_ms: u64, max_fetch_attempts: u32) -> TestProxy {
        let images = ImageService::new(
            InMemoryObjectStore::new("canonical"),
            InMemoryObjectStore::new("variants"),
            ImageConfig {
                max_width: 1024,
                max_height: 1024,
                jpeg_quality: 95,
                max_source_bytes: 1024 * 1024,
                max_output_width: 4096,
                max_output_height: 4096,
            },
        );
        let config = ProxyConfig {
            backoff_base_ms,
            max_fetch_attempts,
            fetch_timeout_secs: 5,
            max_redirects: 5,
            user_agent: "test".to_string(),
        };
        MediaProxy::new(images, MemoryMetadataStore::new(), fetcher, &config)
    }

    fn seeded_fetcher() -> ScriptedFetcher {
        ScriptedFetcher::default()
            .reply(LIVE, Reply::Ok(png_bytes(128, 64)))
            .reply(DEAD, Reply::Status(StatusCode::NOT_FOUND))
            .reply(ERR, Reply::Transport)
    }

    async fn record(proxy: &TestProxy, id: &str) -> Media {
        proxy.metadata().get(&[id.to_string()]).await.unwrap().remove(0)
    }

    async fn lookup_id(proxy: &TestProxy, url: &str) -> String {
        let found = proxy.lookup_by_url(&[url.to_string()]).await.unwrap();
        found[url].id.clone()
    }

    #[tokio::test]
    async fn test_valid_fetch_scenario() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let urls = vec![LIVE.to_string(), DEAD.to_string(), ERR.to_string()];
        let found = proxy.lookup_by_url(&urls).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[LIVE].id, "_q-DEX7MXsZYYDz63Ycwtw");
        assert_eq!(found[DEAD].id, "IjE18UlMhDg3D6fnHRy_dw");
        assert!(found.values().all(|m| m.status == MediaStatus::NotFetched));

        let (_, live) = proxy.image_reader(&found[LIVE].id, None).await.unwrap();
        assert_eq!(live.status, MediaStatus::Stored);
        assert_eq!(record(&proxy, &live.id).await.status, MediaStatus::Stored);

        let err = proxy.image_reader(&found[DEAD].id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, .. }));
        let dead = record(&proxy, &found[DEAD].id).await;
        assert_eq!(dead.status, MediaStatus::FailedPermanent);
        assert_eq!(dead.fail_reason, "Not Found");

        let err = proxy.image_reader(&found[ERR].id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: false, .. }));
        let failed = record(&proxy, &found[ERR].id).await;
        assert_eq!(failed.status, MediaStatus::FailedTransient);
        assert!(failed.fail_reason.starts_with("request failed:"));
        assert_eq!(failed.fetch_attempts, 1);
        assert!(failed.last_fetch.is_some());
    }

    #[tokio::test]
    async fn test_lookup_filters_bad_urls() {
        let proxy = proxy_with(ScriptedFetcher::default(), 1000, 10);
        let urls = vec![
            "http://ok.example/x".to_string(),
            "not-a-url".to_string(),
            "http://127.0.0.1/x".to_string(),
            "http://127.0.0.1:8080/x.jpg".to_string(),
        ];
        let found = proxy.lookup_by_url(&urls).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("http://ok.example/x"));
        assert_eq!(proxy.metadata().len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_is_idempotent() {
        let proxy = proxy_with(ScriptedFetcher::default(), 1000, 10);
        let urls = vec![LIVE.to_string(), LIVE.to_string()];
        let first = proxy.lookup_by_url(&urls).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = proxy.lookup_by_url(&urls).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(proxy.metadata().len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_returns_existing_state() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let id = lookup_id(&proxy, DEAD).await;
        proxy.image_reader(&id, None).await.unwrap_err();

        let found = proxy.lookup_by_url(&[DEAD.to_string()]).await.unwrap();
        assert_eq!(found[DEAD].status, MediaStatus::FailedPermanent);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let err = proxy.image_reader("unknown", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { .. }));
        assert_eq!(proxy.fetcher().requests(), 0);
    }

    #[tokio::test]
    async fn test_host_resolving_to_loopback_is_permanent() {
        let url = "http://internal-images.example.com/x.jpg";
        let fetcher = ScriptedFetcher::default()
            .host("internal-images.example.com", "127.0.0.1")
            .reply(url, Reply::Ok(png_bytes(8, 8)));
        let proxy = proxy_with(fetcher, 1000, 10);
        let id = lookup_id(&proxy, url).await;

        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, ref reason } if reason.starts_with("invalid host:")));
        assert_eq!(proxy.fetcher().requests(), 0);
        assert_eq!(record(&proxy, &id).await.status, MediaStatus::FailedPermanent);
    }

    #[tokio::test]
    async fn test_blocked_connection_is_permanent() {
        let url = "http://cdn.example.com/moved.jpg";
        let fetcher = ScriptedFetcher::default().reply(url, Reply::Blocked("intranet.example.com"));
        let proxy = proxy_with(fetcher, 1000, 10);
        let id = lookup_id(&proxy, url).await;

        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, ref reason }
            if reason == "invalid host: intranet.example.com"));
        let stored = record(&proxy, &id).await;
        assert_eq!(stored.status, MediaStatus::FailedPermanent);
        assert_eq!(stored.fail_reason, "invalid host: intranet.example.com");
    }

    #[tokio::test]
    async fn test_dns_failure_is_transient() {
        let url = "http://flaky-dns.example.com/x.jpg";
        let fetcher = ScriptedFetcher::default()
            .unresolvable("flaky-dns.example.com")
            .reply(url, Reply::Ok(png_bytes(8, 8)));
        let proxy = proxy_with(fetcher, 1000, 10);
        let id = lookup_id(&proxy, url).await;

        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: false, ref reason } if reason.contains("dns lookup")));
        assert_eq!(proxy.fetcher().requests(), 0);
        assert_eq!(record(&proxy, &id).await.status, MediaStatus::FailedTransient);
    }

    #[tokio::test]
    async fn test_stored_record_with_loopback_url_is_permanent() {
        let proxy = proxy_with(ScriptedFetcher::default(), 1000, 10);
        let media = Media::not_fetched("http://127.0.0.1:8080/x.jpg");
        proxy.metadata().put(std::slice::from_ref(&media)).await.unwrap();

        let err = proxy.image_reader(&media.id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, ref reason } if reason.starts_with("invalid host:")));
        assert_eq!(proxy.fetcher().requests(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_latched() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let id = lookup_id(&proxy, DEAD).await;

        proxy.image_reader(&id, None).await.unwrap_err();
        assert_eq!(proxy.fetcher().requests(), 1);

        // The remote recovers, but a permanent failure is never retried.
        proxy.fetcher().set_reply(DEAD, Reply::Ok(png_bytes(8, 8)));
        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, ref reason } if reason == "Not Found"));
        assert_eq!(proxy.fetcher().requests(), 1);
    }

    #[tokio::test]
    async fn test_forbidden_and_unauthorized_are_permanent() {
        let forbidden = "http://sprucehealth.com/forbidden.jpg";
        let unauthorized = "http://sprucehealth.com/unauthorized.jpg";
        let fetcher = ScriptedFetcher::default()
            .reply(forbidden, Reply::Status(StatusCode::FORBIDDEN))
            .reply(unauthorized, Reply::Status(StatusCode::UNAUTHORIZED));
        let proxy = proxy_with(fetcher, 1000, 10);

        for url in [forbidden, unauthorized] {
            let id = lookup_id(&proxy, url).await;
            let err = proxy.image_reader(&id, None).await.unwrap_err();
            assert!(matches!(err, ProxyError::FetchFailed { permanent: true, .. }));
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let url = "http://sprucehealth.com/busy.jpg";
        let fetcher =
            ScriptedFetcher::default().reply(url, Reply::Status(StatusCode::SERVICE_UNAVAILABLE));
        let proxy = proxy_with(fetcher, 1000, 10);
        let id = lookup_id(&proxy, url).await;

        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: false, ref reason } if reason == "Service Unavailable"));
        assert_eq!(record(&proxy, &id).await.status, MediaStatus::FailedTransient);
    }

    #[tokio::test]
    async fn test_transient_backoff() {
        let proxy = proxy_with(seeded_fetcher(), 20, 10);
        let id = lookup_id(&proxy, ERR).await;

        proxy.image_reader(&id, None).await.unwrap_err();
        assert_eq!(proxy.fetcher().requests(), 1);

        // Inside the 20ms × 2^1 window: no new request.
        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: false, .. }));
        assert_eq!(proxy.fetcher().requests(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        proxy.fetcher().set_reply(ERR, Reply::Ok(png_bytes(16, 16)));
        let (_, media) = proxy.image_reader(&id, None).await.unwrap();
        assert_eq!(proxy.fetcher().requests(), 2);
        assert_eq!(media.status, MediaStatus::Stored);
        assert!(media.fail_reason.is_empty());
    }

    #[tokio::test]
    async fn test_max_attempts_forces_permanent() {
        let proxy = proxy_with(seeded_fetcher(), 0, 2);
        let id = lookup_id(&proxy, ERR).await;

        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: false, .. }));
        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, .. }));

        let media = record(&proxy, &id).await;
        assert_eq!(media.status, MediaStatus::FailedPermanent);
        assert_eq!(media.fetch_attempts, 2);
        proxy.image_reader(&id, None).await.unwrap_err();
        assert_eq!(proxy.fetcher().requests(), 2);
    }

    #[tokio::test]
    async fn test_invalid_image_is_permanent() {
        let url = "http://sprucehealth.com/page.html";
        let fetcher = ScriptedFetcher::default()
            .reply(url, Reply::Ok(Bytes::from_static(b"<html></html>")));
        let proxy = proxy_with(fetcher, 1000, 10);
        let id = lookup_id(&proxy, url).await;

        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, ref reason } if reason.starts_with("invalid image")));
    }

    #[tokio::test]
    async fn test_oversize_response_is_permanent() {
        let url = "http://sprucehealth.com/huge.png";
        let fetcher = ScriptedFetcher::default().reply(url, Reply::TooLarge);
        let proxy = proxy_with(fetcher, 1000, 10);
        let id = lookup_id(&proxy, url).await;

        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailed { permanent: true, ref reason } if reason == REASON_TOO_LARGE));
    }

    #[tokio::test]
    async fn test_fetch_success_returns_exact_bytes() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let id = lookup_id(&proxy, LIVE).await;
        let expected = png_bytes(128, 64);

        let (body, media) = proxy.image_reader(&id, None).await.unwrap();
        assert_eq!(body, expected);
        assert_eq!(media.status, MediaStatus::Stored);
        assert_eq!((media.width, media.height), (128, 64));
        assert_eq!(media.size, expected.len() as u64);
        assert_eq!(media.mime_type, "image/png");
        assert_eq!(record(&proxy, &id).await, media);

        // Stored: served without another request.
        let (again, _) = proxy.image_reader(&id, None).await.unwrap();
        assert_eq!(again, expected);
        assert_eq!(proxy.fetcher().requests(), 1);
    }

    #[tokio::test]
    async fn test_resize_requests() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let id = lookup_id(&proxy, LIVE).await;
        proxy.image_reader(&id, None).await.unwrap();

        let (body, _) = proxy
            .image_reader(&id, Some(&ImageSize::new(128, 64)))
            .await
            .unwrap();
        assert_eq!(crate::image::probe(&body).unwrap(), ("image/png", 128, 64));

        let (body, _) = proxy
            .image_reader(&id, Some(&ImageSize::new(0, 0)))
            .await
            .unwrap();
        assert_eq!(body, png_bytes(128, 64));
    }

    #[tokio::test]
    async fn test_oversize_request_rejected_before_fetch() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let id = lookup_id(&proxy, LIVE).await;

        let size = ImageSize::new(4097, 100).scale_up();
        let err = proxy.image_reader(&id, Some(&size)).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput { .. }));
        assert_eq!(err.status_code(), 400);
        assert_eq!(proxy.fetcher().requests(), 0);
        assert_eq!(record(&proxy, &id).await.status, MediaStatus::NotFetched);
    }

    #[tokio::test]
    async fn test_first_fetch_with_size_returns_resized() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let id = lookup_id(&proxy, LIVE).await;
        let (body, media) = proxy
            .image_reader(&id, Some(&ImageSize::new(32, 32).cropped()))
            .await
            .unwrap();
        assert_eq!(crate::image::probe(&body).unwrap(), ("image/png", 32, 32));
        // The record describes the original.
        assert_eq!((media.width, media.height), (128, 64));
    }

    #[tokio::test]
    async fn test_variant_survives_missing_original() {
        let proxy = proxy_with(seeded_fetcher(), 1000, 10);
        let id = lookup_id(&proxy, LIVE).await;
        let size = ImageSize::new(32, 32).cropped();
        let (first, _) = proxy.image_reader(&id, Some(&size)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let canonical = proxy.images().canonical();
        canonical.delete(&canonical.id_from_name(&id)).await.unwrap();

        let (second, _) = proxy.image_reader(&id, Some(&size)).await.unwrap();
        assert_eq!(first, second);

        // The original itself is gone: store drift surfaces as NotFound.
        let err = proxy.image_reader(&id, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { .. }));
        assert_eq!(record(&proxy, &id).await.status, MediaStatus::Stored);
    }

    #[tokio::test]
    async fn test_stored_record_missing_dimensions_is_refreshed() {
        let proxy = proxy_with(ScriptedFetcher::default(), 1000, 10);
        let mut media = Media::not_fetched("http://sprucehealth.com/legacy.png");
        proxy
            .images()
            .put_bytes(&media.id, png_bytes(40, 20))
            .await
            .unwrap();
        media.status = MediaStatus::Stored;
        proxy.metadata().put(std::slice::from_ref(&media)).await.unwrap();

        let (_, refreshed) = proxy.image_reader(&media.id, None).await.unwrap();
        assert_eq!((refreshed.width, refreshed.height), (40, 20));
        assert_eq!(refreshed.mime_type, "image/png");
        assert_eq!(record(&proxy, &media.id).await, refreshed);
        assert_eq!(proxy.fetcher().requests(), 0);
    }
}
