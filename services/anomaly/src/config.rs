use crate::asset_store::AssetKind;
use anyhow::{ensure, Result};
use serde::Deserialize;
use std::time::Duration;

/// S3 rejects non-final multipart parts smaller than this
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Main configuration for the anomaly service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration. Absent means the in-memory record store is used.
    pub database: Option<DatabaseConfig>,
    /// Asset store (S3) configuration
    pub asset_store: AssetStoreConfig,
    /// Analyzer configuration
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Asset store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AssetStoreConfig {
    /// S3 bucket name for uploaded media
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL assets are served from. Defaults to the virtual-hosted
    /// S3 URL of the bucket.
    pub public_base_url: Option<String>,
    /// Kind of media this deployment accepts
    #[serde(default = "default_asset_kind")]
    pub kind: AssetKind,
    /// Key prefix for uploaded assets. Defaults per asset kind.
    pub folder: Option<String>,
    /// Upload timeout in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// External analyzer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Analyzer base URL; `/analyze` is appended. Required when enabled.
    pub base_url: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_analyzer_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Disable to skip dispatch entirely (records stay unknown)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long shutdown waits for in-flight notifications, in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted upload body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "anomaly-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_asset_kind() -> AssetKind {
    AssetKind::Video
}

fn default_upload_timeout_secs() -> u64 {
    120
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_analyzer_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    200 * 1024 * 1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "anomaly-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/anomaly").required(false))
            .add_source(config::File::with_name("/etc/anomaly/service").required(false))
            // ANOMALY__ASSET_STORE__BUCKET -> asset_store.bucket
            .add_source(
                config::Environment::with_prefix("ANOMALY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later, mid-request
    pub fn validate(&self) -> Result<()> {
        self.asset_store.validate()?;
        ensure!(
            !self.analyzer.enabled || self.analyzer.base_url.is_some(),
            "analyzer.base_url is required unless analyzer.enabled is false"
        );
        Ok(())
    }

    /// Get asset upload timeout as Duration
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_store.upload_timeout_secs)
    }

    /// Get analyzer request timeout as Duration
    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_secs(self.analyzer.request_timeout_secs)
    }

    /// Get the shutdown wait for analyzer notifications as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.analyzer.drain_timeout_secs)
    }
}

impl AssetStoreConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.part_size_bytes >= MIN_PART_SIZE,
            "asset_store.part_size_bytes must be at least {} bytes, got {}",
            MIN_PART_SIZE,
            self.part_size_bytes
        );
        ensure!(
            self.multipart_threshold_bytes > 0,
            "asset_store.multipart_threshold_bytes must be positive"
        );
        Ok(())
    }

    /// Folder assets are uploaded under
    pub fn folder(&self) -> &str {
        self.folder
            .as_deref()
            .unwrap_or_else(|| self.kind.default_folder())
    }

    /// Base URL used to build public asset URLs
    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: default_analyzer_timeout_secs(),
            enabled: true,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset_store_config() -> AssetStoreConfig {
        AssetStoreConfig {
            bucket: "anomaly-media".to_string(),
            region: "eu-central-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
            kind: AssetKind::Video,
            folder: None,
            upload_timeout_secs: default_upload_timeout_secs(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_upload_timeout_secs(), 120);
        assert_eq!(default_analyzer_timeout_secs(), 30);
        assert_eq!(ApiConfig::default().port, 8080);
    }

    #[test]
    fn test_folder_defaults_per_kind() {
        let mut config = asset_store_config();
        assert_eq!(config.folder(), "anomaly-videos");

        config.kind = AssetKind::Image;
        assert_eq!(config.folder(), "anomaly-pics");

        config.folder = Some("custom".to_string());
        assert_eq!(config.folder(), "custom");
    }

    #[test]
    fn test_public_base_url() {
        let mut config = asset_store_config();
        assert_eq!(
            config.public_base_url(),
            "https://anomaly-media.s3.eu-central-1.amazonaws.com"
        );

        config.public_base_url = Some("https://cdn.example.com/".to_string());
        assert_eq!(config.public_base_url(), "https://cdn.example.com");
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: Config = config::Config::builder()
            .set_override("asset_store.bucket", "media")
            .unwrap()
            .set_override("asset_store.kind", "image")
            .unwrap()
            .set_override("analyzer.base_url", "http://localhost:8000")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.database.is_none());
        assert_eq!(config.asset_store.kind, AssetKind::Image);
        assert!(config.analyzer.enabled);
        assert_eq!(config.service.name, "anomaly-service");
        assert!(config.validate().is_ok());
    }

    fn build(overrides: &[(&str, &str)]) -> Config {
        let mut builder = config::Config::builder();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap().try_deserialize().unwrap()
    }

    #[test]
    fn test_analyzer_section_optional_when_disabled() {
        let config = build(&[
            ("asset_store.bucket", "media"),
            ("analyzer.enabled", "false"),
        ]);
        assert!(config.analyzer.base_url.is_none());
        assert!(config.validate().is_ok());

        let config = build(&[("asset_store.bucket", "media")]);
        assert!(config.analyzer.enabled);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("analyzer.base_url"));
    }

    #[test]
    fn test_part_size_validation() {
        let mut config = asset_store_config();
        assert!(config.validate().is_ok());

        config.part_size_bytes = 0;
        assert!(config.validate().is_err());

        config.part_size_bytes = MIN_PART_SIZE - 1;
        assert!(config.validate().is_err());

        config.part_size_bytes = 8 * 1024 * 1024;
        config.multipart_threshold_bytes = 0;
        assert!(config.validate().is_err());

        config.multipart_threshold_bytes = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_part_size() {
        let config = build(&[
            ("asset_store.bucket", "media"),
            ("asset_store.part_size_bytes", "0"),
            ("analyzer.enabled", "false"),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("part_size_bytes"));
    }
}
