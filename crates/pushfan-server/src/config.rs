use std::collections::BTreeMap;
use std::net::SocketAddr;

use pushfan_db_postgres::PostgresConfig;
use pushfan_notifications::{
    DEFAULT_CURSOR_BATCH_SIZE, DEFAULT_PROCESS_BATCH_SIZE, DEFAULT_WORK_QUEUE_CAPACITY,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Redis holding the provider queues
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Push pipeline validations
        if self.push.process_push_batch_size == 0 {
            return Err("push.process_push_batch_size must be > 0".into());
        }
        if self.push.cursor_batch_size == 0 {
            return Err("push.cursor_batch_size must be > 0".into());
        }
        if self.push.work_queue_capacity == 0 {
            return Err("push.work_queue_capacity must be > 0".into());
        }
        if self.push.encryption_key.trim().is_empty() {
            return Err("push.encryption_key is required".into());
        }
        if self.push.encryption_iv.trim().is_empty() {
            return Err("push.encryption_iv is required".into());
        }
        if let Some(base) = &self.server.public_base_url {
            let parsed = url::Url::parse(base)
                .map_err(|e| format!("server.public_base_url is not a valid URL: {e}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err("server.public_base_url must be an http(s) URL".into());
            }
        }
        for (provider, prefixes) in &self.push.push_endpoint_mappings {
            if prefixes.iter().all(|p| p.trim().is_empty()) {
                return Err(format!(
                    "push.push_endpoint_mappings.{provider} needs at least one url prefix"
                ));
            }
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Storage validation
        if self.storage.backend == StorageBackend::Postgres {
            self.storage
                .postgres
                .validate()
                .map_err(|e| format!("storage.postgres: {e}"))?;
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Base URL the callback links point at.
    /// If `public_base_url` is configured, returns that; otherwise computes from host:port.
    pub fn public_base_url(&self) -> String {
        self.server
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this server, used in callback links.
    /// If not set, defaults to http://{host}:{port}
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Records per subscription or token batch
    #[serde(default = "default_process_push_batch_size")]
    pub process_push_batch_size: usize,

    /// Contacts fetched per storage page
    #[serde(default = "default_cursor_batch_size")]
    pub cursor_batch_size: usize,

    /// Provider name to endpoint URL prefixes, e.g. `google = ["https://fcm.googleapis.com"]`
    #[serde(default)]
    pub push_endpoint_mappings: BTreeMap<String, Vec<String>>,

    /// AES-256 key for tracking ids, 32 bytes as hex or base64
    #[serde(default)]
    pub encryption_key: String,

    /// Nonce derivation material, at least 16 bytes as hex or base64
    #[serde(default)]
    pub encryption_iv: String,

    /// Dispatch runs that may wait in the background queue
    #[serde(default = "default_work_queue_capacity")]
    pub work_queue_capacity: usize,
}

fn default_process_push_batch_size() -> usize {
    DEFAULT_PROCESS_BATCH_SIZE
}
fn default_cursor_batch_size() -> usize {
    DEFAULT_CURSOR_BATCH_SIZE
}
fn default_work_queue_capacity() -> usize {
    DEFAULT_WORK_QUEUE_CAPACITY
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            process_push_batch_size: default_process_push_batch_size(),
            cursor_batch_size: default_cursor_batch_size(),
            push_endpoint_mappings: BTreeMap::new(),
            encryption_key: String::new(),
            encryption_iv: String::new(),
            work_queue_capacity: default_work_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Postgres,
    /// Process-local storage for development. Contents are lost on restart.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".into()
}
fn default_redis_pool_size() -> usize {
    16
}
fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "pushfan.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., PUSHFAN__PUSH__ENCRYPTION_KEY=...
        builder = builder.add_source(
            Environment::with_prefix("PUSHFAN")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.push.encryption_key = "00".repeat(32);
        cfg.push.encryption_iv = "11".repeat(16);
        cfg
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.push.process_push_batch_size, 10);
        assert_eq!(cfg.push.cursor_batch_size, 500);
        assert_eq!(cfg.push.work_queue_capacity, 1024);
        assert_eq!(cfg.redis.pool_size, 16);
        assert_eq!(cfg.storage.backend, StorageBackend::Postgres);
        assert_eq!(cfg.storage.postgres.stats_retention_days, 360);
        assert_eq!(cfg.public_base_url(), "http://0.0.0.0:8080");
    }

    #[test]
    fn test_missing_encryption_material_is_rejected() {
        let err = AppConfig::default().validate().unwrap_err();
        assert!(err.contains("encryption_key"));

        let mut cfg = valid();
        cfg.push.encryption_iv = "  ".into();
        assert!(cfg.validate().unwrap_err().contains("encryption_iv"));

        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_sizes_are_rejected() {
        let mut cfg = valid();
        cfg.push.process_push_batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.push.cursor_batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }

    #[test]
    fn test_postgres_section_checked_only_for_postgres_backend() {
        let mut cfg = valid();
        cfg.storage.postgres.pool_size = 0;
        assert!(cfg.validate().unwrap_err().contains("storage.postgres"));

        cfg.storage.backend = StorageBackend::Memory;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_public_base_url_must_be_http() {
        let mut cfg = valid();
        cfg.server.public_base_url = Some("not a url".into());
        assert!(cfg.validate().unwrap_err().contains("public_base_url"));

        cfg.server.public_base_url = Some("ftp://push.example.com".into());
        assert!(cfg.validate().is_err());

        cfg.server.public_base_url = Some("https://push.example.com/track".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_toml_sections() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            public_base_url = "https://push.example.com"

            [push]
            process_push_batch_size = 25
            encryption_key = "k"
            encryption_iv = "iv"

            [push.push_endpoint_mappings]
            google = ["https://fcm.googleapis.com"]

            [storage]
            backend = "memory"

            [storage.postgres]
            pool_size = 4
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.public_base_url(), "https://push.example.com");
        assert_eq!(cfg.push.process_push_batch_size, 25);
        assert_eq!(cfg.push.cursor_batch_size, 500);
        assert_eq!(
            cfg.push.push_endpoint_mappings["google"],
            vec!["https://fcm.googleapis.com".to_string()]
        );
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.storage.postgres.pool_size, 4);
        assert!(cfg.storage.postgres.run_migrations);
    }

    #[test]
    fn test_loader_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushfan.toml");
        std::fs::write(
            &path,
            format!(
                "[push]\nencryption_key = \"{}\"\nencryption_iv = \"{}\"\n[logging]\nlevel = \"debug\"\n",
                "ab".repeat(32),
                "cd".repeat(16)
            ),
        )
        .unwrap();

        let cfg = loader::load_config(path.to_str()).unwrap();
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.push.encryption_key, "ab".repeat(32));
    }
}
