use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{redirect, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::core::config::ProxyConfig;
use crate::core::error::FetchError;
use crate::core::security::{is_blocked_ip, parse_remote_url};

/// Status and body of a completed remote request. Non-success statuses are
/// returned, not raised; the proxy decides what they mean.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Network access used by the proxy: DNS resolution for the host safety
/// check and the GET itself.
pub trait RemoteFetcher: Send + Sync + 'static {
    /// Resolve `host` to the addresses a connection would use.
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Vec<IpAddr>, FetchError>> + Send;

    /// GET `url`, reading at most `max_bytes` of body.
    fn fetch(
        &self,
        url: &Url,
        max_bytes: u64,
    ) -> impl Future<Output = Result<FetchResponse, FetchError>> + Send;
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

/// Source of DNS answers.
pub trait HostLookup: Send + Sync + 'static {
    fn lookup(&self, host: String) -> impl Future<Output = std::io::Result<Vec<IpAddr>>> + Send + 'static;
}

/// The system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup(&self, host: String) -> impl Future<Output = std::io::Result<Vec<IpAddr>>> + Send + 'static {
        async move {
            let addrs = tokio::net::lookup_host((host.as_str(), 0)).await?;
            Ok(addrs.map(|a| a.ip()).collect())
        }
    }
}

/// Raised by [`GuardedResolver`] when a name resolves to a blocked network.
#[derive(Debug)]
pub struct BlockedHost {
    pub host: String,
}

impl fmt::Display for BlockedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resolves to a blocked address", self.host)
    }
}

impl std::error::Error for BlockedHost {}

/// reqwest resolver that refuses names resolving to blocked networks.
///
/// Every connection the client opens goes through it, redirect hops
/// included, so the addresses checked are the ones actually dialled.
#[derive(Debug)]
pub struct GuardedResolver<L> {
    lookup: L,
}

impl<L: HostLookup> Resolve for GuardedResolver<L> {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let lookup = self.lookup.lookup(host.clone());
        Box::pin(checked_addrs(host, lookup))
    }
}

async fn checked_addrs(
    host: String,
    lookup: impl Future<Output = std::io::Result<Vec<IpAddr>>>,
) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let ips = lookup.await?;
    if ips.is_empty() || ips.iter().any(|ip| is_blocked_ip(*ip)) {
        warn!(host = %host, addrs = ?ips, "refusing connection to blocked address");
        return Err(Box::new(BlockedHost { host }));
    }
    // The connector replaces the port with the one from the URL.
    Ok(Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0))))
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// reqwest-backed fetcher.
///
/// Redirects are followed up to `max_redirects`, and every hop must pass
/// the same URL filter as the original request. Names are resolved through
/// a [`GuardedResolver`].
#[derive(Debug, Clone)]
pub struct HttpFetcher<L = SystemLookup> {
    client: reqwest::Client,
    resolver: Arc<GuardedResolver<L>>,
}

fn redirect_policy(max_redirects: usize) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            return attempt.error(format!("stopped after {} redirects", max_redirects));
        }
        match parse_remote_url(attempt.url().as_str()) {
            Ok(_) => attempt.follow(),
            Err(reason) => attempt.error(format!("redirect rejected: {}", reason)),
        }
    })
}

impl HttpFetcher {
    pub fn new(config: &ProxyConfig) -> Result<Self, FetchError> {
        Self::with_lookup(config, SystemLookup)
    }
}

impl<L: HostLookup> HttpFetcher<L> {
    pub fn with_lookup(config: &ProxyConfig, lookup: L) -> Result<Self, FetchError> {
        let resolver = Arc::new(GuardedResolver { lookup });
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(redirect_policy(config.max_redirects))
            // A proxy would dial the target itself, past the resolver.
            .no_proxy()
            .dns_resolver(resolver.clone())
            .build()
            .map_err(|e| FetchError::Transport {
                reason: e.to_string(),
            })?;
        Ok(Self { client, resolver })
    }
}

fn blocked_host<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a BlockedHost> {
    if let Some(blocked) = err.downcast_ref::<BlockedHost>() {
        return Some(blocked);
    }
    // io::Error::source skips its payload.
    err.downcast_ref::<std::io::Error>()
        .and_then(|io| io.get_ref())
        .and_then(|inner| inner.downcast_ref::<BlockedHost>())
}

fn transport(err: reqwest::Error) -> FetchError {
    // Include the source chain; reqwest's Display alone is often just "error sending request".
    let mut reason = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(e) = source {
        if let Some(blocked) = blocked_host(e) {
            return FetchError::InvalidHost {
                host: blocked.host.clone(),
            };
        }
        reason.push_str(": ");
        reason.push_str(&e.to_string());
        source = e.source();
    }
    FetchError::Transport { reason }
}

impl<L: HostLookup> RemoteFetcher for HttpFetcher<L> {
    async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<IpAddr>, FetchError> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        // A lookup failure may be a resolver outage; it says nothing about the host.
        self.resolver
            .lookup
            .lookup(host.to_string())
            .await
            .map_err(|e| FetchError::Transport {
                reason: format!("dns lookup for {} failed: {}", host, e),
            })
    }

    async fn fetch(&self, url: &Url, max_bytes: u64) -> Result<FetchResponse, FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();

        if let Some(len) = response.content_length() {
            if status.is_success() && len > max_bytes {
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            if (body.len() + chunk.len()) as u64 > max_bytes {
                if status.is_success() {
                    return Err(FetchError::TooLarge { limit: max_bytes });
                }
                // Error bodies are not used; stop reading.
                break;
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "remote fetch complete");
        Ok(FetchResponse {
            status,
            body: body.freeze(),
        })
    }
}
