//! Configuration for Offload Server.
//!
//! Precedence: explicit `--config` file, then `OFFLOAD_CONFIG`, then default
//! file locations, then built-in defaults; environment variables override
//! whatever the file supplied.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Root for staging and scratch directories. Everything under it is
    /// transient; durable state lives in the document store and the providers.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Master key secret. Generated and persisted in the settings collection
    /// on first boot when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_secret: Option<String>,

    /// JSON snapshot path for the document store. None = volatile in-memory
    /// store (tests, demos).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Plaintext chunk size. The effective size is capped by the smallest
    /// configured provider attachment limit.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,

    /// Parallel part uploads per archive.
    #[serde(default = "default_upload_parts_concurrency")]
    pub upload_parts_concurrency: usize,

    /// Attempts per part upload before the archive fails.
    #[serde(default = "default_upload_retry_max")]
    pub upload_retry_max: u32,

    /// Exponential backoff base delay in milliseconds.
    #[serde(default = "default_upload_retry_base_ms")]
    pub upload_retry_base_ms: u64,

    /// Per-attempt backoff cap in milliseconds.
    #[serde(default = "default_upload_retry_max_ms")]
    pub upload_retry_max_ms: u64,

    /// Below this many free GiB at the staging root, finish work but sleep a
    /// poll between archives.
    #[serde(default = "default_disk_soft_limit_gb")]
    pub disk_soft_limit_gb: u64,

    /// Below this many free GiB, lease no new work at all.
    #[serde(default = "default_disk_hard_limit_gb")]
    pub disk_hard_limit_gb: u64,

    /// Concurrent scheduler units per process.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Scheduler tick interval in milliseconds.
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,

    /// Archives stuck in `processing` longer than this are reset to `queued`.
    #[serde(default = "default_processing_stale_minutes")]
    pub processing_stale_minutes: i64,

    /// Remove staging/work directories after a successful upload.
    #[serde(default = "default_cache_delete_after_upload")]
    pub cache_delete_after_upload: bool,

    /// Greedy bundle packing ceiling.
    #[serde(default = "default_bundle_max_bytes")]
    pub bundle_max_bytes: u64,

    /// Files at or above this size always become their own archive.
    #[serde(default = "default_bundle_single_file_bytes")]
    pub bundle_single_file_bytes: u64,

    /// Bot-family provider credentials. None disables the bot provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<BotConfig>,

    /// Cap for tokio's blocking thread pool (None = tokio default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_threads: Option<usize>,
}

/// Bot-family provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub token: String,
    pub chat_id: String,

    /// Override the API base URL (tests point this at a local fake).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8200".parse().unwrap()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_chunk_size_bytes() -> u64 {
    8 * 1024 * 1024 // 8 MiB
}

fn default_upload_parts_concurrency() -> usize {
    3
}

fn default_upload_retry_max() -> u32 {
    5
}

fn default_upload_retry_base_ms() -> u64 {
    1500
}

fn default_upload_retry_max_ms() -> u64 {
    15_000
}

fn default_disk_soft_limit_gb() -> u64 {
    10
}

fn default_disk_hard_limit_gb() -> u64 {
    2
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_worker_poll_ms() -> u64 {
    2000
}

fn default_processing_stale_minutes() -> i64 {
    30
}

fn default_cache_delete_after_upload() -> bool {
    true
}

fn default_bundle_max_bytes() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_bundle_single_file_bytes() -> u64 {
    16 * 1024 * 1024 // 16 MiB
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            master_secret: None,
            store_path: None,
            chunk_size_bytes: default_chunk_size_bytes(),
            upload_parts_concurrency: default_upload_parts_concurrency(),
            upload_retry_max: default_upload_retry_max(),
            upload_retry_base_ms: default_upload_retry_base_ms(),
            upload_retry_max_ms: default_upload_retry_max_ms(),
            disk_soft_limit_gb: default_disk_soft_limit_gb(),
            disk_hard_limit_gb: default_disk_hard_limit_gb(),
            worker_concurrency: default_worker_concurrency(),
            worker_poll_ms: default_worker_poll_ms(),
            processing_stale_minutes: default_processing_stale_minutes(),
            cache_delete_after_upload: default_cache_delete_after_upload(),
            bundle_max_bytes: default_bundle_max_bytes(),
            bundle_single_file_bytes: default_bundle_single_file_bytes(),
            bot: None,
            blocking_threads: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration: file if available, then environment overrides.
    pub fn load() -> Self {
        let mut config = None;

        if let Ok(path) = std::env::var("OFFLOAD_CONFIG") {
            if let Ok(c) = Self::from_file(&path) {
                config = Some(c);
            }
        }

        if config.is_none() {
            for path in &["offload.toml", "/etc/offload/config.toml"] {
                if std::path::Path::new(path).exists() {
                    if let Ok(c) = Self::from_file(path) {
                        config = Some(c);
                        break;
                    }
                }
            }
        }

        let mut config = config.unwrap_or_default();
        config.apply_env();
        config
    }

    /// Apply environment variable overrides on top of whatever the file gave us.
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("OFFLOAD_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.listen_addr = parsed;
            }
        }
        if let Ok(dir) = std::env::var("OFFLOAD_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(secret) = std::env::var("OFFLOAD_MASTER_SECRET") {
            if !secret.is_empty() {
                self.master_secret = Some(secret);
            }
        }
        if let Ok(path) = std::env::var("OFFLOAD_STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }

        env_parse("OFFLOAD_CHUNK_SIZE_BYTES", &mut self.chunk_size_bytes);
        env_parse(
            "OFFLOAD_UPLOAD_PARTS_CONCURRENCY",
            &mut self.upload_parts_concurrency,
        );
        env_parse("OFFLOAD_UPLOAD_RETRY_MAX", &mut self.upload_retry_max);
        env_parse("OFFLOAD_UPLOAD_RETRY_BASE_MS", &mut self.upload_retry_base_ms);
        env_parse("OFFLOAD_UPLOAD_RETRY_MAX_MS", &mut self.upload_retry_max_ms);
        env_parse("OFFLOAD_DISK_SOFT_LIMIT_GB", &mut self.disk_soft_limit_gb);
        env_parse("OFFLOAD_DISK_HARD_LIMIT_GB", &mut self.disk_hard_limit_gb);
        env_parse("OFFLOAD_WORKER_CONCURRENCY", &mut self.worker_concurrency);
        env_parse("OFFLOAD_WORKER_POLL_MS", &mut self.worker_poll_ms);
        env_parse(
            "OFFLOAD_PROCESSING_STALE_MINUTES",
            &mut self.processing_stale_minutes,
        );
        env_parse("OFFLOAD_BUNDLE_MAX_BYTES", &mut self.bundle_max_bytes);
        env_parse(
            "OFFLOAD_BUNDLE_SINGLE_FILE_BYTES",
            &mut self.bundle_single_file_bytes,
        );

        if let Ok(v) = std::env::var("OFFLOAD_CACHE_DELETE_AFTER_UPLOAD") {
            self.cache_delete_after_upload = v == "true" || v == "1";
        }
        if let Ok(bt) = std::env::var("OFFLOAD_BLOCKING_THREADS") {
            if let Ok(parsed) = bt.parse() {
                self.blocking_threads = Some(parsed);
            }
        }

        if let Ok(token) = std::env::var("OFFLOAD_BOT_TOKEN") {
            let chat_id = std::env::var("OFFLOAD_BOT_CHAT_ID").unwrap_or_default();
            if !token.is_empty() && !chat_id.is_empty() {
                self.bot = Some(BotConfig {
                    token,
                    chat_id,
                    api_base: std::env::var("OFFLOAD_BOT_API_BASE").ok(),
                });
            }
        }
    }

    /// Staging tree: plaintext bytes awaiting encryption and upload.
    pub fn staging_root(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Per-request scratch space for restores and mirror transfers.
    pub fn scratch_root(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.parse() {
            *target = parsed;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 8200);
        assert_eq!(config.chunk_size_bytes, 8 * 1024 * 1024);
        assert_eq!(config.upload_retry_max, 5);
        assert_eq!(config.worker_poll_ms, 2000);
        assert!(config.bot.is_none());
        assert!(config.disk_hard_limit_gb < config.disk_soft_limit_gb);
    }

    #[test]
    fn test_config_parse_toml() {
        let toml = r#"
            listen_addr = "0.0.0.0:9090"
            data_dir = "/var/lib/offload"
            chunk_size_bytes = 1048576
            worker_concurrency = 4

            [bot]
            token = "123:abc"
            chat_id = "-100987"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_addr.port(), 9090);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/offload"));
        assert_eq!(config.chunk_size_bytes, 1048576);
        assert_eq!(config.worker_concurrency, 4);

        let bot = config.bot.expect("bot config");
        assert_eq!(bot.token, "123:abc");
        assert_eq!(bot.chat_id, "-100987");
        assert!(bot.api_base.is_none());
    }

    #[test]
    fn test_scratch_paths_under_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/offload-test"),
            ..Default::default()
        };
        assert_eq!(config.staging_root(), PathBuf::from("/tmp/offload-test/staging"));
        assert_eq!(config.scratch_root(), PathBuf::from("/tmp/offload-test/scratch"));
    }
}
