use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub image: ImageConfig,
    pub proxy: ProxyConfig,
    pub metadata: MetadataConfig,
    pub signer: SignerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

/// Object storage backend for originals and variants.
///
/// Variants live in the `cache` sub-namespace of the same backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory`, `filesystem`, or `s3`.
    pub backend: String,
    #[serde(default = "default_local_path")]
    pub local_path: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_local_path() -> String {
    "/tmp/mediaproxy".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// 0 = unbounded.
    pub max_width: u32,
    /// 0 = unbounded.
    pub max_height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,
    /// Largest width a resize may produce.
    #[serde(default = "default_max_output_dimension")]
    pub max_output_width: u32,
    /// Largest height a resize may produce.
    #[serde(default = "default_max_output_dimension")]
    pub max_output_height: u32,
}

fn default_jpeg_quality() -> u8 {
    95
}
fn default_max_source_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_max_output_dimension() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_max_fetch_attempts() -> u32 {
    10
}
fn default_fetch_timeout_secs() -> u64 {
    20
}
fn default_max_redirects() -> usize {
    5
}
fn default_user_agent() -> String {
    format!("mediaproxy/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// `memory` or `sqlite`.
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// `host:port` of a memcached server. Empty disables the metadata cache.
    #[serde(default)]
    pub memcached_addr: String,
    /// 0 selects the default of 7 days.
    #[serde(default)]
    pub cache_ttl_secs: u64,
}

fn default_sqlite_path() -> String {
    "/tmp/mediaproxy/metadata.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    pub base_url: String,
    /// The first key signs; every key verifies.
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl AppConfig {
    /// Load configuration with layered overrides:
    /// 1. config/default.toml
    /// 2. config/{env}.toml (based on MEDIAPROXY_ENV)
    /// 3. Environment variables (MEDIAPROXY_* prefix)
    pub fn load() -> anyhow::Result<Self> {
        let default_path = Path::new("config/default.toml");
        let default_content = std::fs::read_to_string(default_path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", default_path.display(), e))?;

        let mut config: AppConfig = toml::from_str(&default_content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", default_path.display(), e))?;

        // Layer 2: environment-specific overrides
        let env_name =
            std::env::var("MEDIAPROXY_ENV").unwrap_or_else(|_| "development".to_string());
        let env_path = format!("config/{}.toml", env_name);
        if let Ok(env_content) = std::fs::read_to_string(&env_path) {
            config = toml::from_str(&env_content)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", env_path, e))?;
        }

        // Layer 3: environment variable overrides (selected keys)
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Apply `MEDIAPROXY_*` overrides from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MEDIAPROXY_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(port) = lookup("MEDIAPROXY_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(v) = lookup("MEDIAPROXY_STORAGE_BACKEND") {
            self.storage.backend = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_STORAGE_LOCAL_PATH") {
            self.storage.local_path = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_STORAGE_BUCKET") {
            self.storage.bucket = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_STORAGE_ENDPOINT") {
            self.storage.endpoint = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_STORAGE_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_STORAGE_ACCESS_KEY_ID") {
            self.storage.access_key_id = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_STORAGE_SECRET_ACCESS_KEY") {
            self.storage.secret_access_key = v;
        }
        if let Some(n) = lookup("MEDIAPROXY_IMAGE_MAX_WIDTH").and_then(|v| v.parse().ok()) {
            self.image.max_width = n;
        }
        if let Some(n) = lookup("MEDIAPROXY_IMAGE_MAX_HEIGHT").and_then(|v| v.parse().ok()) {
            self.image.max_height = n;
        }
        if let Some(v) = lookup("MEDIAPROXY_METADATA_BACKEND") {
            self.metadata.backend = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_METADATA_SQLITE_PATH") {
            self.metadata.sqlite_path = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_METADATA_MEMCACHED_ADDR") {
            self.metadata.memcached_addr = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_SIGNER_BASE_URL") {
            self.signer.base_url = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_SIGNER_KEYS") {
            self.signer.keys = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("MEDIAPROXY_OBSERVABILITY_LOG_LEVEL") {
            self.observability.log_level = v;
        }
        if let Some(v) = lookup("MEDIAPROXY_OBSERVABILITY_LOG_FORMAT") {
            self.observability.log_format = v;
        }
    }

    /// Reject combinations that cannot be served.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.storage.backend.as_str() {
            "memory" | "filesystem" => {}
            "s3" => {
                if self.storage.bucket.is_empty() {
                    anyhow::bail!("storage.bucket is required for the s3 backend");
                }
            }
            other => anyhow::bail!("unknown storage.backend '{}'", other),
        }
        match self.metadata.backend.as_str() {
            "memory" | "sqlite" => {}
            other => anyhow::bail!("unknown metadata.backend '{}'", other),
        }
        if self.image.jpeg_quality == 0 || self.image.jpeg_quality > 100 {
            anyhow::bail!(
                "image.jpeg_quality must be in 1..=100, got {}",
                self.image.jpeg_quality
            );
        }
        if self.image.max_output_width == 0 || self.image.max_output_height == 0 {
            anyhow::bail!("image.max_output_width and image.max_output_height must be non-zero");
        }
        if self.proxy.max_fetch_attempts == 0 {
            anyhow::bail!("proxy.max_fetch_attempts must be at least 1");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                cors_allowed_origins: vec!["*".to_string()],
            },
            storage: StorageConfig {
                backend: "filesystem".to_string(),
                local_path: default_local_path(),
                bucket: String::new(),
                prefix: String::new(),
                region: "us-east-1".to_string(),
                endpoint: String::new(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                path_style: false,
                request_timeout_secs: default_request_timeout_secs(),
            },
            image: ImageConfig {
                max_width: 2048,
                max_height: 2048,
                jpeg_quality: default_jpeg_quality(),
                max_source_bytes: default_max_source_bytes(),
                max_output_width: default_max_output_dimension(),
                max_output_height: default_max_output_dimension(),
            },
            proxy: ProxyConfig {
                backoff_base_ms: default_backoff_base_ms(),
                max_fetch_attempts: default_max_fetch_attempts(),
                fetch_timeout_secs: default_fetch_timeout_secs(),
                max_redirects: default_max_redirects(),
                user_agent: default_user_agent(),
            },
            metadata: MetadataConfig {
                backend: "sqlite".to_string(),
                sqlite_path: default_sqlite_path(),
                memcached_addr: String::new(),
                cache_ttl_secs: 0,
            },
            signer: SignerConfig {
                base_url: "http://localhost:8080/media/signed".to_string(),
                keys: Vec::new(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: "json".to_string(),
                metrics_enabled: true,
            },
        }
    }
}
