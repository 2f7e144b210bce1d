use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use mediaproxy::core::config::AppConfig;
use mediaproxy::core::shutdown::{ShutdownCoordinator, HTTP_DRAIN_TIMEOUT_SECS};
use mediaproxy::delivery::router::{self, AppState};
use mediaproxy::image::ImageService;
use mediaproxy::metadata::MetadataBackend;
use mediaproxy::observability::metrics as obs_metrics;
use mediaproxy::proxy::{HttpFetcher, MediaProxy};
use mediaproxy::signer::Signer;
use mediaproxy::storage::{ObjectBackend, ObjectStore};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration (layered: default.toml → {env}.toml → env vars)
    let config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    // The recorder must be installed before any metric is recorded.
    let metrics_handle = if config.observability.metrics_enabled {
        match obs_metrics::install_prometheus_recorder() {
            Ok(handle) => {
                obs_metrics::describe_all_metrics();
                Some(handle)
            }
            Err(e) => {
                warn!(error = %e, "failed to install metrics recorder, metrics disabled");
                None
            }
        }
    } else {
        None
    };

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        obs_metrics::inc_panic_total();
        let backtrace = std::backtrace::Backtrace::force_capture();
        eprintln!("PANIC: {info}\nBacktrace:\n{backtrace}");
        default_hook(info);
    }));

    info!(version = env!("CARGO_PKG_VERSION"), "mediaproxy starting");

    match run(config, metrics_handle).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    config: AppConfig,
    metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> anyhow::Result<()> {
    let shutdown = ShutdownCoordinator::new();

    let (canonical, variants) = ObjectBackend::from_config(&config.storage).await?;
    info!(
        backend = %config.storage.backend,
        canonical = canonical.label(),
        variants = variants.label(),
        "object storage ready"
    );
    let images = ImageService::new(canonical, variants, config.image.clone());

    let metadata = MetadataBackend::from_config(&config.metadata)?;
    info!(
        backend = %config.metadata.backend,
        memcached = !config.metadata.memcached_addr.is_empty(),
        "metadata store ready"
    );

    let fetcher = HttpFetcher::new(&config.proxy)?;
    let proxy = MediaProxy::new(images, metadata, fetcher, &config.proxy);

    let signer = if config.signer.keys.is_empty() {
        info!("no signing keys configured, signed urls disabled");
        None
    } else {
        let base_url: url::Url = config
            .signer
            .base_url
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid signer.base_url: {}", e))?;
        let keys = config.signer.keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        let signer = Signer::new(base_url, keys)?;
        info!(keys = config.signer.keys.len(), "signer ready");
        Some(Arc::new(signer))
    };

    let start_time = Instant::now();
    let state = AppState {
        proxy: Arc::new(proxy),
        start_time,
        signer,
        metrics_handle,
    };
    let app = router::build_router(state, &config.server.cors_allowed_origins);

    let uptime_cancel = shutdown.token();
    tokio::spawn(async move {
        obs_metrics::run_uptime_task(start_time, uptime_cancel).await;
    });

    let http_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid HTTP bind address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", http_addr, e))?;
    info!(%http_addr, "HTTP server listening");

    let shutdown_token = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
            })
            .await
    });

    shutdown.wait_for_signal_and_shutdown().await;

    info!(timeout_secs = HTTP_DRAIN_TIMEOUT_SECS, "draining HTTP connections");
    match tokio::time::timeout(
        std::time::Duration::from_secs(HTTP_DRAIN_TIMEOUT_SECS),
        server,
    )
    .await
    {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(anyhow::anyhow!("HTTP server error: {}", e)),
        Ok(Err(e)) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
        Err(_) => {
            warn!("HTTP drain timed out, exiting with connections open");
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
